// Pipeline processing: normalization, feature extraction, audit and eval

pub mod audit;
pub mod bins;
pub mod eval;
pub mod keywords;
pub mod normalize;
