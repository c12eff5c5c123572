pub mod cache;
pub mod game;
pub mod go;
pub mod mcts;
pub mod model;
pub mod selfplay;
pub mod selfplay_cmd;
pub mod util;

mod selfplay_test;
