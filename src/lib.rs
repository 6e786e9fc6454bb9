pub mod chain;
pub mod io;
pub mod ladder;
pub mod posterior;
pub mod sampler;
pub mod stats;
