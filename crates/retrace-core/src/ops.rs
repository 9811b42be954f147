pub mod arithmetic;
pub mod convolution;
pub mod manipulation;
pub mod pool;
pub mod reduction;
pub mod regularization;
