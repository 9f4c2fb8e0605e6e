pub mod prices;
pub mod production;

pub use prices::*;
pub use production::*;
