//! Container formats.

pub mod csw;
pub mod tibet;
pub mod uef;

pub use csw::CswTape;
pub use tibet::TibetTape;
pub use uef::UefTape;
