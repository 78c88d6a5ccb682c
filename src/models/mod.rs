mod instances;
mod intents;
mod results;

pub use instances::*;
pub use intents::*;
pub use results::*;
