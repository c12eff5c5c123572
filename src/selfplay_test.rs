#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use itertools::Itertools;

    use crate::cache::{InferenceCache, NullCache, ShardedCache};
    use crate::game::Game;
    use crate::go::{zobrist, Position};
    use crate::mcts::{MctsTree, MctsTreeOptions};
    use crate::model::{Model, ModelError, ModelFactory, ModelInput, ModelOutput};
    use crate::selfplay::{SelfplayConfig, SelfplayGame, SelfplayOptions, Selfplayer};

    fn test_config(seed: u64, num_games: u64) -> SelfplayConfig {
        let mut config = SelfplayConfig {
            model: "stub.net".to_string(),
            num_games,
            seed,
            num_readouts: 8,
            virtual_losses: 4,
            selfplay_threads: 1,
            parallel_search: 1,
            parallel_inference: 1,
            concurrent_games_per_thread: 1,
            verbose: false,
            ..SelfplayConfig::default()
        };
        config.validate_and_clamp().unwrap();
        config
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tengen-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn collect_files(root: &Path, extension: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == extension) {
                    files.push(path);
                }
            }
        }
        files.sort();
        files
    }

    fn strip_date(sgf: &str) -> String {
        match (sgf.find("DT["), sgf.find("DT[").and_then(|i| sgf[i..].find(']'))) {
            (Some(start), Some(end)) => format!("{}{}", &sgf[..start], &sgf[start + end + 1..]),
            _ => sgf.to_string(),
        }
    }

    fn default_options() -> SelfplayOptions {
        SelfplayOptions {
            num_virtual_losses: 4,
            num_readouts: 8,
            fastplay_readouts: 2,
            fastplay_frequency: 0.0,
            dirichlet_alpha: 0.03,
            noise_mix: 0.25,
            is_holdout: false,
            target_pruning: false,
            verbose: false,
            allow_pass: true,
        }
    }

    fn new_selfplay_game(options: SelfplayOptions, seed: u64, resign_enabled: bool) -> SelfplayGame {
        zobrist::init(0);
        let game_options = crate::game::GameOptions {
            resign_enabled,
            resign_threshold: -0.8,
            ..Default::default()
        };
        let game = Game::new("test".to_string(), "test".to_string(), game_options);
        let tree = MctsTree::new(Position::new(), MctsTreeOptions::default());
        SelfplayGame::new(options, game, tree, seed)
    }

    struct DriveStats {
        cycles: usize,
        total_queued: usize,
        /// Inferences queued by the very first select pass.
        first_cycle_queued: usize,
        move_watermarks: Vec<(u32, u32)>,
    }

    /// Runs one game through the select/infer/process/play cycle the way a
    /// `SelfplayThread` does, checking the virtual-loss pairing invariant
    /// along the way.
    fn drive_game(
        selfplay_game: &mut SelfplayGame,
        model: &mut dyn Model,
        cache: &dyn InferenceCache,
    ) -> DriveStats {
        let mut stats = DriveStats {
            cycles: 0,
            total_queued: 0,
            first_cycle_queued: 0,
            move_watermarks: Vec::new(),
        };
        let mut expected_target = selfplay_game.options().num_readouts;

        while !selfplay_game.game().game_over() {
            stats.cycles += 1;
            assert!(stats.cycles < 100_000, "game failed to make progress");

            let mut inferences = Vec::new();
            let queued = selfplay_game.select_leaves(cache, &mut inferences);
            assert_eq!(queued, inferences.len());
            assert!(queued <= selfplay_game.options().num_virtual_losses as usize);
            stats.total_queued += queued;
            if stats.cycles == 1 {
                stats.first_cycle_queued = queued;
            }

            if !inferences.is_empty() {
                let inputs = inferences.iter().map(|x| &x.input).collect_vec();
                let mut outputs = vec![ModelOutput::default(); inputs.len()];
                model.run_many(&inputs, &mut outputs).unwrap();
                for (inference, output) in inferences.iter_mut().zip(outputs) {
                    inference.output = output;
                }
            }
            for inference in &inferences {
                cache.merge(
                    inference.cache_key,
                    inference.canonical_sym,
                    inference.input.sym,
                    &inference.output,
                );
            }
            let model_name = model.name().to_string();
            selfplay_game.process_inferences(&model_name, &inferences);

            /* every queued inference paid back its virtual loss */
            assert_eq!(selfplay_game.tree().root().num_virtual_losses(), 0);

            let n_before = selfplay_game.tree().root().n();
            if selfplay_game.maybe_play_move() {
                stats.move_watermarks.push((n_before, expected_target));
                expected_target = selfplay_game.tree().root().n()
                    + selfplay_game.options().num_readouts;
            }
        }
        stats
    }

    fn uniform_model() -> Box<dyn Model> {
        ModelFactory::new("uniform", "")
            .new_model("stub.net")
            .unwrap()
    }

    /// Always sees a lost position for black.
    struct PessimistModel;

    impl Model for PessimistModel {
        fn name(&self) -> &str {
            "pessimist"
        }

        fn feature_descriptor(&self) -> crate::model::FeatureDescriptor {
            crate::model::FeatureDescriptor::default()
        }

        fn run_many(
            &mut self,
            inputs: &[&ModelInput],
            outputs: &mut [ModelOutput],
        ) -> Result<(), ModelError> {
            assert_eq!(inputs.len(), outputs.len());
            for output in outputs.iter_mut() {
                output.policy = [1.0 / crate::go::NUM_MOVES as f32; crate::go::NUM_MOVES];
                output.value = -1.0;
            }
            Ok(())
        }
    }

    #[test]
    fn readout_watermark_holds_at_every_move() {
        let mut game = new_selfplay_game(default_options(), 42, false);
        let stats = drive_game(&mut game, uniform_model().as_mut(), &NullCache);
        assert!(!stats.move_watermarks.is_empty());
        for (n_at_play, target) in stats.move_watermarks {
            assert!(n_at_play >= target, "{n_at_play} < {target}");
        }
        /* the null cache never hits */
        assert!(stats.total_queued > 0);
    }

    #[test]
    fn zero_fastplay_frequency_trains_every_move() {
        let mut game = new_selfplay_game(default_options(), 42, false);
        drive_game(&mut game, uniform_model().as_mut(), &NullCache);
        assert!(game.game().moves().iter().all(|m| m.trainable));
    }

    #[test]
    fn full_fastplay_frequency_trains_only_the_first_move() {
        let options = SelfplayOptions {
            fastplay_frequency: 1.0,
            ..default_options()
        };
        let mut game = new_selfplay_game(options, 7, false);
        drive_game(&mut game, uniform_model().as_mut(), &NullCache);
        let moves = game.game().moves();
        assert!(moves.len() > 1);
        assert!(moves[0].trainable, "move 0 is never fast");
        assert!(moves[1..].iter().all(|m| !m.trainable));
    }

    #[test]
    fn fastplay_oscillation_mixes_fast_and_full_moves() {
        /* S2 */
        let options = SelfplayOptions {
            fastplay_frequency: 0.5,
            ..default_options()
        };
        let mut game = new_selfplay_game(options, 7, false);
        drive_game(&mut game, uniform_model().as_mut(), &NullCache);
        let moves = game.game().moves();
        let trainable = moves.iter().filter(|m| m.trainable).count();
        assert!(trainable > 0 && trainable < moves.len());
    }

    #[test]
    fn warm_cache_cuts_the_second_game_short() {
        /* S3: two identical games sharing one cache */
        zobrist::init(0);
        let cache = ShardedCache::new(ShardedCache::calculate_capacity(64), 2);
        let mut model = uniform_model();

        let mut first = new_selfplay_game(default_options(), 1, false);
        let first_stats = drive_game(&mut first, model.as_mut(), &cache);
        let hits_after_first = cache.stats().hits;

        let mut second = new_selfplay_game(default_options(), 1, false);
        let second_stats = drive_game(&mut second, model.as_mut(), &cache);

        assert!(cache.stats().hits > hits_after_first);
        /* the cold game had to evaluate the empty board; the warm one got
         * it straight out of the cache */
        assert_eq!(first_stats.first_cycle_queued, 1);
        assert_eq!(second_stats.first_cycle_queued, 0);
        /* far fewer inferences than the virtual-loss budget would allow */
        assert!(second_stats.total_queued < second_stats.cycles * 4);
    }

    #[test]
    fn resignation_follows_the_per_game_switch() {
        /* S6, at the game level: a hopeless position resigns only when
         * resignation is enabled */
        let mut resigning = new_selfplay_game(default_options(), 5, true);
        drive_game(&mut resigning, &mut PessimistModel, &NullCache);
        let result = resigning.game().result().unwrap();
        assert_eq!(result.reason, crate::game::GameOverReason::Resign);
        assert_eq!(result.winner, Some(crate::go::Color::White));

        let mut stubborn = new_selfplay_game(default_options(), 5, false);
        drive_game(&mut stubborn, &mut PessimistModel, &NullCache);
        let result = stubborn.game().result().unwrap();
        assert_ne!(result.reason, crate::game::GameOverReason::Resign);
    }

    #[test]
    fn single_game_run_writes_an_sgf() {
        /* S1 */
        zobrist::init(42);
        let dir = scratch_dir("s1");
        let mut config = test_config(42, 1);
        config.sgf_dir = dir.join("sgf").to_string_lossy().into_owned();
        config.output_dir = dir.join("examples").to_string_lossy().into_owned();
        config.fastplay_frequency = 0.0;
        config.disable_resign_pct = 1.0;

        let selfplayer = Selfplayer::new(config).unwrap();
        selfplayer.run().unwrap();

        let clean = collect_files(&dir.join("sgf").join("clean"), "sgf");
        let full = collect_files(&dir.join("sgf").join("full"), "sgf");
        assert_eq!(clean.len(), 1);
        assert_eq!(full.len(), 1);
        let examples = collect_files(&dir.join("examples"), "traindata");
        assert_eq!(examples.len(), 1);

        let stats = selfplayer.win_stats();
        assert_eq!(
            stats.black_wins.total + stats.white_wins.total + stats.draws,
            1
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn fixed_seed_single_thread_runs_are_identical() {
        /* invariant 6: bit-identical SGFs under a fixed seed */
        zobrist::init(0);
        let mut sgfs = Vec::new();
        for run in 0..2 {
            let dir = scratch_dir(&format!("det-{run}"));
            let mut config = test_config(1234, 1);
            config.sgf_dir = dir.to_string_lossy().into_owned();
            config.disable_resign_pct = 1.0;
            let selfplayer = Selfplayer::new(config).unwrap();
            selfplayer.run().unwrap();

            let files = collect_files(&dir.join("clean"), "sgf");
            assert_eq!(files.len(), 1);
            sgfs.push(strip_date(&fs::read_to_string(&files[0]).unwrap()));
            fs::remove_dir_all(&dir).unwrap();
        }
        assert_eq!(sgfs[0], sgfs[1]);
    }

    #[test]
    fn quota_is_exact_with_more_threads_than_games() {
        /* S5: 8 threads race a quota of 3; every thread must terminate and
         * exactly 3 games must come out */
        zobrist::init(0);
        let dir = scratch_dir("s5");
        let mut config = test_config(9, 3);
        config.selfplay_threads = 8;
        config.parallel_inference = 2;
        config.sgf_dir = dir.to_string_lossy().into_owned();
        config.validate_and_clamp().unwrap();

        let selfplayer = Selfplayer::new(config).unwrap();
        selfplayer.run().unwrap();

        let files = collect_files(&dir.join("clean"), "sgf");
        assert_eq!(files.len(), 3);
        /* output names never collide */
        assert_eq!(files.iter().unique().count(), 3);
        let stats = selfplayer.win_stats();
        assert_eq!(
            stats.black_wins.total + stats.white_wins.total + stats.draws,
            3
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn scarce_model_pool_still_completes() {
        /* S4: four threads share one model handle */
        zobrist::init(0);
        let dir = scratch_dir("s4");
        let mut config = test_config(11, 4);
        config.selfplay_threads = 4;
        config.parallel_inference = 1;
        config.parallel_search = 2;
        config.sgf_dir = dir.to_string_lossy().into_owned();
        config.validate_and_clamp().unwrap();

        let selfplayer = Selfplayer::new(config).unwrap();
        selfplayer.run().unwrap();
        assert_eq!(collect_files(&dir.join("clean"), "sgf").len(), 4);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn holdout_sampling_tracks_the_configured_fraction() {
        zobrist::init(0);
        let mut config = test_config(17, 2000);
        config.holdout_pct = 0.25;
        config.validate_and_clamp().unwrap();
        let selfplayer = Selfplayer::new(config).unwrap();

        let mut holdouts = 0;
        let mut total = 0;
        while let Some(game) = selfplayer.start_new_game(false) {
            total += 1;
            if game.options().is_holdout {
                holdouts += 1;
            }
        }
        assert_eq!(total, 2000);
        let fraction = holdouts as f64 / total as f64;
        assert!((fraction - 0.25).abs() < 0.05, "fraction {fraction}");
    }

    #[test]
    fn holdout_games_land_in_the_holdout_dir() {
        zobrist::init(0);
        let dir = scratch_dir("holdout");
        let mut config = test_config(3, 2);
        config.holdout_pct = 1.0;
        config.output_dir = dir.join("train").to_string_lossy().into_owned();
        config.holdout_dir = dir.join("holdout").to_string_lossy().into_owned();
        config.validate_and_clamp().unwrap();

        let selfplayer = Selfplayer::new(config).unwrap();
        selfplayer.run().unwrap();
        assert_eq!(collect_files(&dir.join("train"), "traindata").len(), 0);
        assert_eq!(collect_files(&dir.join("holdout"), "traindata").len(), 2);
        fs::remove_dir_all(&dir).unwrap();
    }
}
