pub mod activation;
pub mod attention;
pub mod finite;
pub mod gemv;
pub mod norm;
pub mod precision;
pub mod rope;
pub mod runtime;
pub mod softmax;
