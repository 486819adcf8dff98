pub mod assemble;
pub mod convert;
pub mod score;
pub mod train;
