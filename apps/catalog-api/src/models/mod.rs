pub mod product;
pub mod region;
pub mod variant;
