//! The inference seam: model inputs/outputs, feature encoding and the
//! built-in engines. A real accelerator backend implements `Model` and
//! registers in `ModelFactory`; the bundled engines exist for development
//! and deterministic testing.

use ndarray::Array4;
use thiserror::Error;

use crate::go::symmetry::Symmetry;
use crate::go::zobrist::mix_bits;
use crate::go::{Color, Coord, Position, N, NUM_MOVES, NUM_POINTS};

/// Number of past positions fed to the network.
pub const POSITION_HISTORY: usize = 8;

/// Two stone planes per history step plus the to-play plane.
pub const NUM_FEATURE_PLANES: usize = 2 * POSITION_HISTORY + 1;

#[derive(Clone, Copy, Debug)]
pub struct FeatureDescriptor {
    pub history_len: usize,
    pub num_planes: usize,
}

impl Default for FeatureDescriptor {
    fn default() -> Self {
        FeatureDescriptor {
            history_len: POSITION_HISTORY,
            num_planes: NUM_FEATURE_PLANES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelInput {
    /// Symmetry to apply to the features before inference.
    pub sym: Symmetry,
    /// Positions leading to the leaf, most recent first.
    pub position_history: Vec<Position>,
}

#[derive(Clone, Debug)]
pub struct ModelOutput {
    pub policy: [f32; NUM_MOVES],
    pub value: f32,
}

impl Default for ModelOutput {
    fn default() -> Self {
        ModelOutput {
            policy: [0.0; NUM_MOVES],
            value: 0.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown inference engine '{0}'")]
    UnknownEngine(String),
    #[error("model path must not be empty")]
    EmptyModelPath,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// One network handle. Handles are not thread-safe; the pool guarantees a
/// handle is only ever driven by one thread at a time.
pub trait Model: Send {
    fn name(&self) -> &str;

    fn feature_descriptor(&self) -> FeatureDescriptor;

    /// Runs the batch, filling one output per input.
    fn run_many(
        &mut self,
        inputs: &[&ModelInput],
        outputs: &mut [ModelOutput],
    ) -> Result<(), ModelError>;
}

/// Encodes a batch of inputs into an NCHW tensor, applying each input's
/// symmetry to the board planes.
pub fn encode_features(inputs: &[&ModelInput]) -> Array4<f32> {
    let dims = (inputs.len(), NUM_FEATURE_PLANES, N, N);
    let mut tensor = Array4::<f32>::zeros(dims);
    for (b, input) in inputs.iter().enumerate() {
        let to_play = input
            .position_history
            .first()
            .map_or(Color::Black, |p| p.to_play());
        for step in 0..POSITION_HISTORY {
            let position = match input.position_history.get(step) {
                Some(p) => p,
                None => break,
            };
            for idx in 0..NUM_POINTS {
                let stone = match position.stone_at(Coord::from_index(idx)) {
                    Some(color) => color,
                    None => continue,
                };
                let plane = 2 * step + usize::from(stone != to_play);
                let dst = input.sym.apply_index(idx);
                tensor[(b, plane, dst / N, dst % N)] = 1.0;
            }
        }
        if to_play == Color::Black {
            for y in 0..N {
                for x in 0..N {
                    tensor[(b, NUM_FEATURE_PLANES - 1, y, x)] = 1.0;
                }
            }
        }
    }
    tensor
}

/// Uniform policy, zero value. The reference stub for deterministic tests.
pub struct UniformModel {
    name: String,
}

impl Model for UniformModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature_descriptor(&self) -> FeatureDescriptor {
        FeatureDescriptor::default()
    }

    fn run_many(
        &mut self,
        inputs: &[&ModelInput],
        outputs: &mut [ModelOutput],
    ) -> Result<(), ModelError> {
        assert_eq!(inputs.len(), outputs.len());
        /* the encoder is exercised even though the stub ignores the tensor */
        let _features = encode_features(inputs);
        for output in outputs.iter_mut() {
            output.policy = [1.0 / NUM_MOVES as f32; NUM_MOVES];
            output.value = 0.0;
        }
        Ok(())
    }
}

/// Pseudo-random but input-deterministic outputs: the same position and
/// symmetry always evaluate identically, so cached and fresh results agree.
pub struct RandomModel {
    name: String,
    seed: u64,
}

impl Model for RandomModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature_descriptor(&self) -> FeatureDescriptor {
        FeatureDescriptor::default()
    }

    fn run_many(
        &mut self,
        inputs: &[&ModelInput],
        outputs: &mut [ModelOutput],
    ) -> Result<(), ModelError> {
        assert_eq!(inputs.len(), outputs.len());
        for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
            let hash = input
                .position_history
                .first()
                .map_or(0, |p| p.stone_hash());
            let mut state = mix_bits(hash ^ self.seed ^ input.sym.index() as u64);
            let mut total = 0.0;
            for p in output.policy.iter_mut() {
                state = mix_bits(state);
                *p = (state % 1000) as f32 + 1.0;
                total += *p;
            }
            for p in output.policy.iter_mut() {
                *p /= total;
            }
            state = mix_bits(state);
            output.value = (state % 2001) as f32 / 1000.0 - 1.0;
        }
        Ok(())
    }
}

/// Creates model handles for the configured engine. Accelerator backends
/// register here; this build knows the CPU-side stubs only.
pub struct ModelFactory {
    engine: String,
    device: String,
}

impl ModelFactory {
    pub fn new(engine: &str, device: &str) -> ModelFactory {
        ModelFactory {
            engine: engine.to_string(),
            device: device.to_string(),
        }
    }

    pub fn new_model(&self, model_path: &str) -> Result<Box<dyn Model>, ModelError> {
        if model_path.is_empty() {
            return Err(ModelError::EmptyModelPath);
        }
        let stem = std::path::Path::new(model_path)
            .file_stem()
            .map_or_else(|| model_path.to_string(), |s| s.to_string_lossy().into_owned());
        let name = format!("{}:{}", self.engine, stem);
        log::debug!("creating model '{name}' on device '{}'", self.device);
        match self.engine.as_str() {
            "uniform" => Ok(Box::new(UniformModel { name })),
            "random" => Ok(Box::new(RandomModel {
                seed: mix_bits(model_path.bytes().fold(0u64, |h, b| {
                    mix_bits(h ^ u64::from(b))
                })),
                name,
            })),
            other => Err(ModelError::UnknownEngine(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::go::zobrist;

    fn input_for(position: Position, sym: Symmetry) -> ModelInput {
        ModelInput {
            sym,
            position_history: vec![position],
        }
    }

    #[test]
    fn uniform_model_fills_every_output() {
        zobrist::init(0);
        let factory = ModelFactory::new("uniform", "");
        let mut model = factory.new_model("stub.net").unwrap();
        assert_eq!(model.name(), "uniform:stub");

        let a = input_for(Position::new(), Symmetry::IDENTITY);
        let b = input_for(Position::new().play(Coord::from_xy(3, 3)), Symmetry::from_index(5));
        let inputs = [&a, &b];
        let mut outputs = vec![ModelOutput::default(); 2];
        model.run_many(&inputs, &mut outputs).unwrap();
        for output in &outputs {
            let sum: f32 = output.policy.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            assert_eq!(output.value, 0.0);
        }
    }

    #[test]
    fn random_model_is_input_deterministic() {
        zobrist::init(0);
        let factory = ModelFactory::new("random", "");
        let mut model = factory.new_model("net.bin").unwrap();

        let input = input_for(Position::new().play(Coord::from_xy(2, 5)), Symmetry::IDENTITY);
        let inputs = [&input];
        let mut first = vec![ModelOutput::default(); 1];
        let mut second = vec![ModelOutput::default(); 1];
        model.run_many(&inputs, &mut first).unwrap();
        model.run_many(&inputs, &mut second).unwrap();
        assert_eq!(first[0].policy, second[0].policy);
        assert_eq!(first[0].value, second[0].value);
        assert!(first[0].value >= -1.0 && first[0].value <= 1.0);
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let factory = ModelFactory::new("tpu", "grpc://tpu0");
        assert!(matches!(
            factory.new_model("net.bin"),
            Err(ModelError::UnknownEngine(_))
        ));
    }

    #[test]
    fn feature_planes_follow_the_symmetry() {
        zobrist::init(0);
        let position = Position::new().play(Coord::from_xy(1, 0));
        for sym in Symmetry::all() {
            let input = input_for(position, sym);
            let inputs = [&input];
            let tensor = encode_features(&inputs);
            let dst = sym.apply_index(Coord::from_xy(1, 0).index());
            /* black stone, white to play: opponent plane of step 0 */
            assert_eq!(tensor[(0, 1, dst / N, dst % N)], 1.0);
            /* to-play plane is zero for white */
            assert_eq!(tensor[(0, NUM_FEATURE_PLANES - 1, 0, 0)], 0.0);
        }
    }
}
