//! Flag surface and entry point of the `selfplay` binary.

use clap::Parser;

use crate::go::zobrist;
use crate::selfplay::{SelfplayConfig, Selfplayer};
use crate::util;

#[derive(Parser, Debug)]
#[clap(about = "Plays concurrent self-play games and writes training data", long_about = None)]
struct SelfplayArgs {
    /* Inference */
    /// Inference engine to use ("uniform" and "random" are built in).
    #[clap(long, default_value = "uniform")]
    engine: String,
    /// Device to run inference on; meaningful only for accelerator engines.
    #[clap(long, default_value = "")]
    device: String,
    /// Path to the model.
    #[clap(long, default_value = "")]
    model: String,
    /// Size of the inference cache in MB. 0 disables the cache.
    #[clap(long, default_value_t = 0)]
    cache_size_mb: usize,
    /// Number of ways to shard the inference cache. Clamped to the total
    /// number of parallel games.
    #[clap(long, default_value_t = 8)]
    cache_shards: usize,

    /* Tree search */
    /// Number of readouts per move.
    #[clap(long, default_value_t = 104)]
    num_readouts: u32,
    /// Fraction of moves played with the reduced read budget.
    #[clap(long, default_value_t = 0.0)]
    fastplay_frequency: f32,
    /// Read budget of a fast-play move.
    #[clap(long, default_value_t = 20)]
    fastplay_readouts: u32,
    /// Number of virtual losses per select pass.
    #[clap(long, default_value_t = 8)]
    virtual_losses: u32,
    /// Alpha of the Dirichlet noise mixed into the root.
    #[clap(long, default_value_t = 0.03)]
    dirichlet_alpha: f32,
    /// Fraction of noise mixed into the root prior.
    #[clap(long, default_value_t = 0.25)]
    noise_mix: f32,
    /// First-play urgency penalty for unvisited children, in [0, 2].
    #[clap(long, default_value_t = 2.0)]
    value_init_penalty: f32,
    /// Prune non-played root visits down to consistency after each move.
    #[clap(long, default_value_t = false)]
    target_pruning: bool,
    /// Soft-pick temperature applied to early-move visit counts.
    #[clap(long, default_value_t = 0.98)]
    policy_softmax_temp: f32,
    /// After five passes, forbid play inside pass-alive areas.
    #[clap(long, default_value_t = false)]
    restrict_in_bensons: bool,
    /// If false, pass is only read and played without alternatives.
    #[clap(long, default_value_t = true)]
    allow_pass: bool,

    /* Threading */
    /// Number of self-play worker threads.
    #[clap(long, default_value_t = 3)]
    selfplay_threads: usize,
    /// Number of tree-search shards per select pass.
    #[clap(long, default_value_t = 3)]
    parallel_search: usize,
    /// Number of model handles in the pool.
    #[clap(long, default_value_t = 2)]
    parallel_inference: usize,
    /// Concurrent games per worker thread; their inferences are batched.
    #[clap(long, default_value_t = 1)]
    concurrent_games_per_thread: usize,

    /* Game */
    /// Random seed; 0 derives one from the clock.
    #[clap(long, default_value_t = 0)]
    seed: u64,
    /// Resign threshold; the sign is ignored, resignation uses -|value|.
    #[clap(long, default_value_t = -0.999, allow_hyphen_values = true)]
    resign_threshold: f32,
    /// Fraction of games with resignation disabled.
    #[clap(long, default_value_t = 0.1)]
    disable_resign_pct: f32,
    /// Total number of games to play. Exactly one of num_games and
    /// run_forever must be set.
    #[clap(long, default_value_t = 0)]
    num_games: u64,
    /// Keep starting new games until killed.
    #[clap(
        long,
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    run_forever: bool,

    /* Output */
    /// Fraction of games held out for validation.
    #[clap(long, default_value_t = 0.03)]
    holdout_pct: f32,
    /// Training example directory. Empty disables example output.
    #[clap(long, default_value = "")]
    output_dir: String,
    /// Holdout example directory. Empty disables holdout output.
    #[clap(long, default_value = "")]
    holdout_dir: String,
    /// SGF directory. Empty disables SGF output.
    #[clap(long, default_value = "")]
    sgf_dir: String,
    /// Log per-move progress for the first game of the first thread.
    #[clap(long, default_value_t = true)]
    verbose: bool,
}

impl SelfplayArgs {
    fn into_config(self) -> SelfplayConfig {
        SelfplayConfig {
            engine: self.engine,
            device: self.device,
            model: self.model,
            cache_size_mb: self.cache_size_mb,
            cache_shards: self.cache_shards,
            num_readouts: self.num_readouts,
            fastplay_frequency: self.fastplay_frequency,
            fastplay_readouts: self.fastplay_readouts,
            virtual_losses: self.virtual_losses,
            dirichlet_alpha: self.dirichlet_alpha,
            noise_mix: self.noise_mix,
            value_init_penalty: self.value_init_penalty,
            target_pruning: self.target_pruning,
            policy_softmax_temp: self.policy_softmax_temp,
            restrict_in_bensons: self.restrict_in_bensons,
            allow_pass: self.allow_pass,
            selfplay_threads: self.selfplay_threads,
            parallel_search: self.parallel_search,
            parallel_inference: self.parallel_inference,
            concurrent_games_per_thread: self.concurrent_games_per_thread,
            seed: self.seed,
            resign_threshold: self.resign_threshold,
            disable_resign_pct: self.disable_resign_pct,
            num_games: self.num_games,
            run_forever: self.run_forever,
            holdout_pct: self.holdout_pct,
            output_dir: self.output_dir,
            holdout_dir: self.holdout_dir,
            sgf_dir: self.sgf_dir,
            verbose: self.verbose,
        }
    }
}

pub fn run_main() -> anyhow::Result<()> {
    util::init_globals();

    let mut config = SelfplayArgs::parse().into_config();
    config.validate_and_clamp()?;
    zobrist::init(config.seed);

    let selfplayer = Selfplayer::new(config)?;
    selfplayer.run()?;
    Ok(())
}
