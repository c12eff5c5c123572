//! The concurrent self-play engine.
//!
//! `SelfplayGame` holds one game's tree search and plays its moves.
//! `SelfplayThread` drives several games in lock-step phases, batching
//! their leaf evaluations into single model calls. `Selfplayer` owns the
//! shared resources: the model pool, the inference cache, the sharded
//! executor and the output queue, which `OutputThread` drains to disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use itertools::Itertools;
use rand::prelude::*;
use rand_distr::{Distribution, Gamma};
use thiserror::Error;

use crate::cache::{CacheKey, InferenceCache, NullCache, ShardedCache};
use crate::game::{Game, GameOptions, WinStats};
use crate::go::symmetry::{Symmetry, NUM_SYMMETRIES};
use crate::go::zobrist::mix_bits;
use crate::go::{sgf, Position, DEFAULT_KOMI, NUM_MOVES};
use crate::mcts::{MctsTree, MctsTreeOptions, NodeId};
use crate::model::{
    FeatureDescriptor, ModelError, ModelFactory, ModelInput, ModelOutput, POSITION_HISTORY,
};
use crate::util::executor::{shard_range, ShardedExecutor};
use crate::util::metrics::RunningAverage;
use crate::util::pool::ModelPool;

/// Largest 64-bit prime; spreads the per-game symmetry salt across leaves.
const SYMMETRY_PRIME: u64 = 18_446_744_073_709_551_557;

#[derive(Clone, Debug)]
pub struct SelfplayConfig {
    /* inference */
    pub engine: String,
    pub device: String,
    pub model: String,
    pub cache_size_mb: usize,
    pub cache_shards: usize,

    /* tree search */
    pub num_readouts: u32,
    pub fastplay_frequency: f32,
    pub fastplay_readouts: u32,
    pub virtual_losses: u32,
    pub dirichlet_alpha: f32,
    pub noise_mix: f32,
    pub value_init_penalty: f32,
    pub target_pruning: bool,
    pub policy_softmax_temp: f32,
    pub restrict_in_bensons: bool,
    pub allow_pass: bool,

    /* threading */
    pub selfplay_threads: usize,
    pub parallel_search: usize,
    pub parallel_inference: usize,
    pub concurrent_games_per_thread: usize,

    /* game */
    pub seed: u64,
    pub resign_threshold: f32,
    pub disable_resign_pct: f32,
    pub num_games: u64,
    pub run_forever: bool,

    /* output */
    pub holdout_pct: f32,
    pub output_dir: String,
    pub holdout_dir: String,
    pub sgf_dir: String,
    pub verbose: bool,
}

impl Default for SelfplayConfig {
    fn default() -> Self {
        SelfplayConfig {
            engine: "uniform".to_string(),
            device: String::new(),
            model: String::new(),
            cache_size_mb: 0,
            cache_shards: 8,
            num_readouts: 104,
            fastplay_frequency: 0.0,
            fastplay_readouts: 20,
            virtual_losses: 8,
            dirichlet_alpha: 0.03,
            noise_mix: 0.25,
            value_init_penalty: 2.0,
            target_pruning: false,
            policy_softmax_temp: 0.98,
            restrict_in_bensons: false,
            allow_pass: true,
            selfplay_threads: 3,
            parallel_search: 3,
            parallel_inference: 2,
            concurrent_games_per_thread: 1,
            seed: 0,
            resign_threshold: -0.999,
            disable_resign_pct: 0.1,
            num_games: 0,
            run_forever: false,
            holdout_pct: 0.03,
            output_dir: String::new(),
            holdout_dir: String::new(),
            sgf_dir: String::new(),
            verbose: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("exactly one of num_games > 0 and run_forever must be set")]
    GamesQuota,
    #[error("model must not be empty")]
    EmptyModel,
}

impl SelfplayConfig {
    /// Fail-fast flag checks, plus the clamps the engine relies on.
    pub fn validate_and_clamp(&mut self) -> Result<(), ConfigError> {
        if self.run_forever {
            if self.num_games != 0 {
                return Err(ConfigError::GamesQuota);
            }
        } else if self.num_games == 0 {
            return Err(ConfigError::GamesQuota);
        }
        if self.model.is_empty() {
            return Err(ConfigError::EmptyModel);
        }

        self.selfplay_threads = self.selfplay_threads.max(1);
        self.parallel_search = self.parallel_search.max(1);
        self.parallel_inference = self.parallel_inference.max(1);
        self.concurrent_games_per_thread = self.concurrent_games_per_thread.max(1);

        /* with a finite quota, a thread playing many more games than the
         * others would drag out the tail of the run */
        if !self.run_forever {
            let max_per_thread =
                (self.num_games as usize).div_ceil(self.selfplay_threads.max(1));
            self.concurrent_games_per_thread =
                self.concurrent_games_per_thread.min(max_per_thread);
        }

        self.resign_threshold = -self.resign_threshold.abs();
        Ok(())
    }

    fn parallel_games(&self) -> usize {
        self.selfplay_threads * self.concurrent_games_per_thread
    }

    fn tree_options(&self) -> MctsTreeOptions {
        MctsTreeOptions {
            value_init_penalty: self.value_init_penalty,
            policy_softmax_temp: self.policy_softmax_temp,
            soft_pick_enabled: true,
            restrict_in_bensons: self.restrict_in_bensons,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SelfplayOptions {
    pub num_virtual_losses: u32,
    pub num_readouts: u32,
    pub fastplay_readouts: u32,
    pub fastplay_frequency: f32,
    pub dirichlet_alpha: f32,
    pub noise_mix: f32,
    pub is_holdout: bool,
    pub target_pruning: bool,
    pub verbose: bool,
    pub allow_pass: bool,
}

/// One pending leaf evaluation.
pub struct Inference {
    pub cache_key: CacheKey,
    pub leaf: NodeId,
    pub canonical_sym: Symmetry,
    pub input: ModelInput,
    pub output: ModelOutput,
}

/// Locates one game's inferences inside a searcher's flat array.
pub struct InferenceSpan {
    pub game: usize,
    pub pos: usize,
    pub len: usize,
}

pub struct SelfplayGame {
    options: SelfplayOptions,
    target_readouts: u32,
    game: Game,
    tree: MctsTree,
    start_time: Instant,
    duration: Duration,
    models_used: Vec<String>,
    rng: StdRng,
    symmetry_mix: u64,
    /* noise waits until the first select pass of the move has expanded the
     * root, and is skipped entirely for fast-play moves */
    inject_noise_before_next_read: bool,
    /* fast play leans on tree reuse, which move 0 has none of */
    fastplay: bool,
}

impl SelfplayGame {
    pub fn new(options: SelfplayOptions, game: Game, tree: MctsTree, seed: u64) -> SelfplayGame {
        let mut rng = StdRng::seed_from_u64(seed);
        let symmetry_mix = rng.random();
        SelfplayGame {
            target_readouts: options.num_readouts,
            options,
            game,
            tree,
            start_time: Instant::now(),
            duration: Duration::ZERO,
            models_used: Vec::new(),
            rng,
            symmetry_mix,
            inject_noise_before_next_read: false,
            fastplay: false,
        }
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut Game {
        &mut self.game
    }

    pub fn tree(&self) -> &MctsTree {
        &self.tree
    }

    pub fn options(&self) -> &SelfplayOptions {
        &self.options
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn models_used(&self) -> &[String] {
        &self.models_used
    }

    /// Selects leaves to evaluate, appending them to `inferences`. Returns
    /// the number queued; cache hits and terminal leaves are incorporated
    /// on the spot and don't count.
    pub fn select_leaves(
        &mut self,
        cache: &dyn InferenceCache,
        inferences: &mut Vec<Inference>,
    ) -> usize {
        if self.inject_noise_before_next_read {
            self.inject_noise_before_next_read = false;
            self.inject_noise();
        }

        let mut num_queued = 0;
        loop {
            let leaf = match self.tree.select_leaf(self.options.allow_pass) {
                Some(leaf) => leaf,
                None => break,
            };

            let node = self.tree.node(leaf);
            if node.game_over() || node.at_move_limit() {
                let value = if node.position.score(self.game.options().komi) > 0.0 {
                    1.0
                } else {
                    -1.0
                };
                self.tree.incorporate_end_game_result(leaf, value);
            } else {
                if self.maybe_queue_inference(leaf, cache, inferences) {
                    num_queued += 1;
                }
                if leaf == self.tree.root_id() {
                    if !self.fastplay {
                        self.inject_noise_before_next_read = true;
                    }
                    break;
                }
            }

            if num_queued >= self.options.num_virtual_losses as usize
                || self.tree.root().n() >= self.target_readouts
            {
                break;
            }
        }
        num_queued
    }

    /// Incorporates the batch results for this game's inferences and pays
    /// back their virtual losses.
    pub fn process_inferences(&mut self, model_name: &str, inferences: &[Inference]) {
        if !model_name.is_empty()
            && self.models_used.last().map(String::as_str) != Some(model_name)
        {
            self.models_used.push(model_name.to_string());
        }
        for inference in inferences {
            self.tree
                .incorporate_results(inference.leaf, &inference.output.policy, inference.output.value);
            self.tree.revert_virtual_loss(inference.leaf);
        }
    }

    /// Plays a move once the read budget is met. Returns false while more
    /// reads are needed.
    pub fn maybe_play_move(&mut self) -> bool {
        if self.tree.root().n() < self.target_readouts {
            return false;
        }

        if self.should_resign() {
            self.game
                .set_game_over_because_of_resign(self.tree.to_play().opposite());
        } else {
            let c = self.tree.pick_move(&mut self.rng);
            if self.options.verbose {
                let position = self.tree.root().position;
                let captures = position.num_captures();
                log::info!("\n{position}");
                log::info!(
                    "Move: {}  Captures X: {} O: {}",
                    position.n(),
                    captures[0],
                    captures[1]
                );
                if !self.fastplay {
                    log::info!("{}", self.tree.describe());
                }
                log::info!("Q: {:.5}", self.tree.root().q());
                log::info!("Played >> {}[{}]", self.tree.to_play(), c);
            }

            let model_annotation = self
                .models_used
                .last()
                .map(|m| format!("model: {m}\n"))
                .unwrap_or_default();
            let search_pi = self.tree.calculate_search_pi();
            let to_play = self.tree.to_play();
            let root_position = self.tree.root().position;
            let root_q = self.tree.root().q();
            self.game
                .add_move(to_play, c, root_position, model_annotation, root_q, search_pi);

            if self.options.target_pruning && !self.fastplay {
                self.tree.reshape_final_visits();
            }

            self.tree.play_move(c);

            if !self.fastplay {
                self.game.mark_last_move_as_trainable();
            }

            let komi = self.game.options().komi;
            if self.tree.at_move_limit() {
                self.game
                    .set_game_over_because_move_limit_reached(self.tree.calculate_score(komi));
            } else if self.tree.is_game_over() {
                self.game
                    .set_game_over_because_of_passes(self.tree.calculate_score(komi));
            }
        }

        if !self.game.game_over() {
            self.fastplay = self.should_fastplay();
            self.inject_noise_before_next_read = !self.fastplay;
            let num_readouts = if self.fastplay {
                self.options.fastplay_readouts
            } else {
                self.options.num_readouts
            };
            self.target_readouts = self.tree.root().n() + num_readouts;
            if !self.fastplay && self.options.fastplay_frequency > 0.0 {
                /* statistics gathered under oscillation mix noise regimes,
                 * so full-read moves start from a bare root */
                self.tree.clear_subtrees();
            }
        } else {
            self.duration = self.start_time.elapsed();
        }

        true
    }

    fn should_fastplay(&mut self) -> bool {
        self.options.fastplay_frequency > 0.0
            && self.rng.random::<f32>() < self.options.fastplay_frequency
    }

    fn should_resign(&self) -> bool {
        self.game.options().resign_enabled
            && self.tree.root().q_from_side_to_move() < self.game.options().resign_threshold
    }

    fn inject_noise(&mut self) {
        if self.options.dirichlet_alpha <= 0.0 || self.options.noise_mix <= 0.0 {
            return;
        }
        let gamma = Gamma::new(self.options.dirichlet_alpha, 1.0).unwrap();
        let mut noise = [0.0f32; NUM_MOVES];
        let mut total = 0.0;
        for n in noise.iter_mut() {
            *n = gamma.sample(&mut self.rng);
            total += *n;
        }
        if total <= 0.0 || !total.is_finite() {
            return;
        }
        for n in noise.iter_mut() {
            *n /= total;
        }
        self.tree.inject_noise(&noise, self.options.noise_mix);
    }

    /// The symmetry to run inference under for this leaf: a stable mix of
    /// the position hash and the per-game salt.
    fn inference_symmetry(&self, leaf: NodeId) -> Symmetry {
        let hash = self.tree.node(leaf).position.stone_hash();
        let bits = mix_bits(hash.wrapping_mul(SYMMETRY_PRIME).wrapping_add(self.symmetry_mix));
        Symmetry::from_index((bits % NUM_SYMMETRIES as u64) as usize)
    }

    fn maybe_queue_inference(
        &mut self,
        leaf: NodeId,
        cache: &dyn InferenceCache,
        inferences: &mut Vec<Inference>,
    ) -> bool {
        let requested_sym = self.inference_symmetry(leaf);
        let node = self.tree.node(leaf);
        let canonical_sym = node.canonical_sym;
        let cache_key = CacheKey::new(node.coord, canonical_sym, &node.position);

        if let Some(cached) = cache.try_get(cache_key, canonical_sym, requested_sym) {
            self.tree
                .incorporate_results(leaf, &cached.policy, cached.value);
            return false;
        }

        let input = ModelInput {
            sym: requested_sym,
            position_history: self.tree.position_history(leaf, POSITION_HISTORY),
        };
        inferences.push(Inference {
            cache_key,
            leaf,
            canonical_sym,
            input,
            output: ModelOutput::default(),
        });
        self.tree.add_virtual_loss(leaf);
        true
    }
}

/// One shard of the leaf-selection pass.
pub struct TreeSearcher {
    cache: Arc<dyn InferenceCache>,
    inferences: Vec<Inference>,
    inference_spans: Vec<InferenceSpan>,
}

impl TreeSearcher {
    pub fn new(cache: Arc<dyn InferenceCache>) -> TreeSearcher {
        TreeSearcher {
            cache,
            inferences: Vec::new(),
            inference_spans: Vec::new(),
        }
    }

    /// Runs leaf selection over a slice of games whose global indices start
    /// at `base`. Results stay valid until the next `search`.
    pub fn search(&mut self, base: usize, games: &mut [Option<Box<SelfplayGame>>]) {
        self.inferences.clear();
        self.inference_spans.clear();
        for (i, slot) in games.iter_mut().enumerate() {
            let game = slot.as_mut().expect("every slot is live during search");
            let pos = self.inferences.len();
            let len = game.select_leaves(self.cache.as_ref(), &mut self.inferences);
            if len > 0 {
                self.inference_spans.push(InferenceSpan {
                    game: base + i,
                    pos,
                    len,
                });
            }
        }
    }

    pub fn inferences(&self) -> &[Inference] {
        &self.inferences
    }

    pub fn inference_spans(&self) -> &[InferenceSpan] {
        &self.inference_spans
    }
}

struct SelfplayThread<'a> {
    thread_id: usize,
    selfplayer: &'a Selfplayer,
    cache: Arc<dyn InferenceCache>,
    games: Vec<Option<Box<SelfplayGame>>>,
    searchers: Vec<TreeSearcher>,
    select_duration: RunningAverage,
}

impl<'a> SelfplayThread<'a> {
    fn new(thread_id: usize, selfplayer: &'a Selfplayer, cache: Arc<dyn InferenceCache>) -> Self {
        let config = selfplayer.config();
        let games = (0..config.concurrent_games_per_thread).map(|_| None).collect();
        let searchers = (0..config.parallel_search)
            .map(|_| TreeSearcher::new(Arc::clone(&cache)))
            .collect();
        SelfplayThread {
            thread_id,
            selfplayer,
            cache,
            games,
            searchers,
            select_duration: RunningAverage::new(
                0.99,
                metrics::gauge!("selfplay.select_leaves_duration"),
            ),
        }
    }

    fn run(mut self) {
        while !self.games.is_empty() {
            self.start_new_games();
            if self.games.is_empty() {
                break;
            }
            self.select_leaves();
            let model_name = self.run_inferences();
            self.process_inferences(&model_name);
            self.play_moves();
        }
    }

    fn start_new_games(&mut self) {
        let mut i = 0;
        while i < self.games.len() {
            if self.games[i].is_none() {
                let verbose =
                    self.selfplayer.config().verbose && self.thread_id == 0 && i == 0;
                match self.selfplayer.start_new_game(verbose) {
                    Some(game) => self.games[i] = Some(game),
                    None => {
                        /* quota drained: shrink the array by swapping the
                         * last slot in and revisiting index i */
                        let last = self.games.len() - 1;
                        self.games.swap(i, last);
                        self.games.pop();
                        continue;
                    }
                }
            }
            i += 1;
        }
    }

    fn select_leaves(&mut self) {
        let select_start = Instant::now();
        let num_games = self.games.len();
        let num_shards = self.searchers.len();

        let mut tasks = Vec::with_capacity(num_shards);
        let mut rest = self.games.as_mut_slice();
        for (i, searcher) in self.searchers.iter_mut().enumerate() {
            let range = shard_range(i, num_shards, num_games);
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
            rest = tail;
            tasks.push(Mutex::new((range.start, searcher, head)));
        }

        self.selfplayer.execute_sharded(|i, _| {
            let mut task = tasks[i].lock().unwrap();
            let (base, searcher, games) = &mut *task;
            searcher.search(*base, games);
        });

        self.select_duration
            .set(select_start.elapsed().as_secs_f64());
    }

    fn run_inferences(&mut self) -> String {
        let inputs = self
            .searchers
            .iter()
            .flat_map(|s| s.inferences.iter().map(|x| &x.input))
            .collect_vec();
        if inputs.is_empty() {
            return String::new();
        }

        let mut outputs = vec![ModelOutput::default(); inputs.len()];
        let mut model = self.selfplayer.acquire_model();
        if let Err(err) = model.run_many(&inputs, &mut outputs) {
            /* every queued inference must produce an output or the search
             * statistics are corrupt */
            log::error!("inference failed: {err}");
            std::process::abort();
        }
        let model_name = model.name().to_string();
        self.selfplayer.release_model(model);

        for (inference, output) in self
            .searchers
            .iter_mut()
            .flat_map(|s| s.inferences.iter_mut())
            .zip(outputs)
        {
            inference.output = output;
        }
        model_name
    }

    fn process_inferences(&mut self, model_name: &str) {
        for searcher in &self.searchers {
            for inference in &searcher.inferences {
                self.cache.merge(
                    inference.cache_key,
                    inference.canonical_sym,
                    inference.input.sym,
                    &inference.output,
                );
            }
            for span in &searcher.inference_spans {
                let game = self.games[span.game].as_mut().unwrap();
                game.process_inferences(
                    model_name,
                    &searcher.inferences[span.pos..span.pos + span.len],
                );
            }
        }
    }

    fn play_moves(&mut self) {
        for slot in &mut self.games {
            let game = slot.as_mut().unwrap();
            if !game.maybe_play_move() {
                continue;
            }
            if game.options().verbose && self.selfplayer.config().cache_size_mb > 0 {
                log::info!("Inference cache stats: {}", self.cache.stats());
            }
            if game.game().game_over() {
                let game = slot.take().unwrap();
                self.selfplayer.end_game(game);
            }
        }
    }
}

struct SharedState {
    num_games_remaining: u64,
    rng: StdRng,
    win_stats: WinStats,
    model_name: String,
}

/// The process-level orchestrator.
pub struct Selfplayer {
    config: SelfplayConfig,
    state: Mutex<SharedState>,
    executor: ShardedExecutor,
    pool: ModelPool,
    feature_descriptor: FeatureDescriptor,
    output_tx: Sender<Option<Box<SelfplayGame>>>,
    output_rx: Mutex<Option<Receiver<Option<Box<SelfplayGame>>>>>,
}

impl Selfplayer {
    /// Builds the model pool and shared state from a validated config.
    pub fn new(config: SelfplayConfig) -> Result<Selfplayer, ModelError> {
        let factory = ModelFactory::new(&config.engine, &config.device);
        let mut models = Vec::with_capacity(config.parallel_inference);
        let mut model_name = String::new();
        let mut feature_descriptor = FeatureDescriptor::default();
        for _ in 0..config.parallel_inference.max(1) {
            let model = factory.new_model(&config.model)?;
            if model_name.is_empty() {
                model_name = model.name().to_string();
                feature_descriptor = model.feature_descriptor();
            }
            models.push(model);
        }

        let seed = if config.seed == 0 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos() as u64
        } else {
            config.seed
        };

        let (output_tx, output_rx) = unbounded();
        Ok(Selfplayer {
            executor: ShardedExecutor::new(config.parallel_search.max(1)),
            pool: ModelPool::new(models),
            feature_descriptor,
            state: Mutex::new(SharedState {
                num_games_remaining: config.num_games,
                rng: StdRng::seed_from_u64(seed),
                win_stats: WinStats::default(),
                model_name,
            }),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            config,
        })
    }

    pub fn config(&self) -> &SelfplayConfig {
        &self.config
    }

    pub fn win_stats(&self) -> WinStats {
        self.state.lock().unwrap().win_stats
    }

    /// Plays games until the quota is drained, then flushes the output
    /// queue. Blocks the calling thread for the whole run.
    pub fn run(&self) -> io::Result<()> {
        let cache: Arc<dyn InferenceCache> = if self.config.cache_size_mb > 0 {
            let capacity = ShardedCache::calculate_capacity(self.config.cache_size_mb);
            let shards = self
                .config
                .cache_shards
                .clamp(1, self.config.parallel_games().max(1));
            log::info!(
                "will cache up to {capacity} inferences in {shards} shards, using roughly {}MB",
                self.config.cache_size_mb
            );
            Arc::new(ShardedCache::new(capacity.max(1), shards))
        } else {
            Arc::new(NullCache)
        };

        let output_rx = self
            .output_rx
            .lock()
            .unwrap()
            .take()
            .expect("run may only be called once");

        let output_result = thread::scope(|scope| {
            let output = OutputThread::new(&self.config, self.feature_descriptor);
            let output_handle = scope.spawn(move || output.run(output_rx));

            let workers = (0..self.config.selfplay_threads)
                .map(|thread_id| {
                    let cache = Arc::clone(&cache);
                    scope.spawn(move || SelfplayThread::new(thread_id, self, cache).run())
                })
                .collect_vec();
            for worker in workers {
                worker.join().expect("selfplay thread panicked");
            }

            self.output_tx.send(None).unwrap();
            output_handle.join().expect("output thread panicked")
        });
        output_result?;

        let state = self.state.lock().unwrap();
        log::info!("{}", state.win_stats.format_table(&state.model_name));
        Ok(())
    }

    /// Claims a slot in the game quota and builds a fresh game, or returns
    /// `None` when the quota is drained.
    pub fn start_new_game(&self, verbose: bool) -> Option<Box<SelfplayGame>> {
        let (game_options, options, game_seed, model_name) = {
            let mut state = self.state.lock().unwrap();
            if !self.config.run_forever {
                if state.num_games_remaining == 0 {
                    return None;
                }
                state.num_games_remaining -= 1;
            }

            let game_options = GameOptions {
                komi: DEFAULT_KOMI,
                resign_threshold: self.config.resign_threshold,
                resign_enabled: state.rng.random::<f32>() >= self.config.disable_resign_pct,
            };
            let options = SelfplayOptions {
                num_virtual_losses: self.config.virtual_losses,
                num_readouts: self.config.num_readouts,
                fastplay_readouts: self.config.fastplay_readouts,
                fastplay_frequency: self.config.fastplay_frequency,
                dirichlet_alpha: self.config.dirichlet_alpha,
                noise_mix: self.config.noise_mix,
                is_holdout: state.rng.random::<f32>() < self.config.holdout_pct,
                target_pruning: self.config.target_pruning,
                verbose,
                allow_pass: self.config.allow_pass,
            };
            (
                game_options,
                options,
                state.rng.random::<u64>(),
                state.model_name.clone(),
            )
        };

        let game = Game::new(model_name.clone(), model_name, game_options);
        let tree = MctsTree::new(Position::new(), self.config.tree_options());
        Some(Box::new(SelfplayGame::new(options, game, tree, game_seed)))
    }

    /// Takes ownership of a finished game, accounts it and queues it for
    /// the output thread.
    pub fn end_game(&self, game: Box<SelfplayGame>) {
        {
            let mut state = self.state.lock().unwrap();
            state.win_stats.update(game.game());
        }
        self.output_tx.send(Some(game)).unwrap();
    }

    /// Concurrent calls run one at a time (unless `parallel_search == 1`),
    /// which pipelines tree search against inference across threads.
    pub fn execute_sharded(&self, f: impl Fn(usize, usize) + Send + Sync) {
        self.executor.execute(f);
    }

    /// Blocks when every handle is in use.
    pub fn acquire_model(&self) -> Box<dyn crate::model::Model> {
        self.pool.acquire()
    }

    pub fn release_model(&self, model: Box<dyn crate::model::Model>) {
        self.pool.release(model);
    }
}

static OUTPUT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes finished games to disk in completion order.
struct OutputThread<'a> {
    config: &'a SelfplayConfig,
    feature_descriptor: FeatureDescriptor,
    start_secs: u64,
}

impl<'a> OutputThread<'a> {
    fn new(config: &'a SelfplayConfig, feature_descriptor: FeatureDescriptor) -> Self {
        OutputThread {
            config,
            feature_descriptor,
            start_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs(),
        }
    }

    fn run(self, output_queue: Receiver<Option<Box<SelfplayGame>>>) -> io::Result<()> {
        let mut game_id = 0u64;
        loop {
            match output_queue.recv() {
                Ok(Some(game)) => {
                    self.write_outputs(game_id, game)?;
                    game_id += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
        assert!(output_queue.is_empty(), "games left behind the sentinel");
        Ok(())
    }

    fn write_outputs(&self, game_id: u64, mut game: Box<SelfplayGame>) -> io::Result<()> {
        let output_name = self.output_name(game_id);
        let now = Utc::now();
        let models_used = game.models_used().join(", ");
        game.game_mut()
            .add_comment(format!("Inferences: [{}]", models_used));
        if self.config.verbose {
            log_end_game_info(&game, game_id);
        }

        if !self.config.sgf_dir.is_empty() {
            let clean = dated_dir(&Path::new(&self.config.sgf_dir).join("clean"), now);
            write_sgf(&clean, &output_name, game.game(), false)?;
            let full = dated_dir(&Path::new(&self.config.sgf_dir).join("full"), now);
            write_sgf(&full, &output_name, game.game(), true)?;
        }

        let example_dir = if game.options().is_holdout {
            &self.config.holdout_dir
        } else {
            &self.config.output_dir
        };
        if !example_dir.is_empty() {
            let dir = dated_dir(Path::new(example_dir), now);
            fs::create_dir_all(&dir)?;
            game.game().write_training_examples(
                self.feature_descriptor.history_len,
                &dir.join(format!("{output_name}.traindata")),
            )?;
        }
        Ok(())
    }

    /// Globally unique per-game name: start timestamp, process-wide
    /// counter, queue position.
    fn output_name(&self, game_id: u64) -> String {
        let counter = OUTPUT_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", self.start_secs, counter, game_id)
    }
}

fn dated_dir(root: &Path, now: DateTime<Utc>) -> PathBuf {
    root.join(now.format("%Y-%m-%d-%H").to_string())
}

fn write_sgf(dir: &Path, name: &str, game: &Game, full: bool) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(format!("{name}.sgf")), sgf::to_sgf(game, full))
}

fn log_end_game_info(game: &SelfplayGame, game_id: u64) {
    let result = game
        .game()
        .result()
        .map(|r| r.to_string())
        .unwrap_or_default();
    log::info!(
        "game {game_id}: {result}, {} moves, {:.1}s, models [{}]",
        game.game().moves().len(),
        game.duration().as_secs_f64(),
        game.models_used().join(", ")
    );
}
