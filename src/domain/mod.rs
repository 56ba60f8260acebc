mod history;
mod ledger;
mod points;

pub use history::*;
pub use ledger::*;
pub use points::*;
