pub mod scenario_repo;

pub use scenario_repo::{ScenarioRepo, StatusUpdate};
