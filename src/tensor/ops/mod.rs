mod activation;
mod arith;
mod mat_mul;
