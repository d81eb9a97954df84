pub mod processes;
pub mod simulations;
