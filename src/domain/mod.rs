pub mod cycle;
pub mod decision;
pub mod market;
pub mod timeframe;

pub use cycle::*;
pub use decision::*;
pub use market::*;
pub use timeframe::*;
