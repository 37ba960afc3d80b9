pub mod provider;
pub mod tier;
pub mod turn;
pub mod user;

pub use provider::*;
pub use tier::*;
pub use turn::*;
pub use user::*;
