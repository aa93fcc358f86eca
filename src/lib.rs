//! # Only Torch Rec
//!
//! `only_torch_rec`是`only_torch`中循环层（rec layer）的独立实现：
//! 给定一个“单元”（unit）的声明（某个固定的循环单元名，或一整个由具名层组成的子网络），
//! 沿时间轴逐步展开计算。子网络可以通过`prev:`引用上一时间步的自身输出，
//! 序列长度可以事先已知，也可以由逐样本的`end`信号动态决定，
//! 并且在同一个循环中内嵌了束搜索（beam search）。
//!

pub mod errors;
pub mod nn;
pub mod tensor;
pub mod utils;
