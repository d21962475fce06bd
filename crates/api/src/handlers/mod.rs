pub mod automations;
pub mod runs;
