/*
 * @Author       : 老董
 * @Date         : 2026-02-04
 * @Description  : 负责循环层（rec layer）及其所依赖的外层网络抽象
 */

mod data;
mod network;
mod params;
pub mod rec;

pub use data::{DType, DataTemplate, ExternData, SeqData};
pub use network::{BaseLayer, NetworkFlags, ParentNetwork};
pub use params::{Init, ParamStore};
pub use rec::{RecLayer, RecLayerConfig, RecOutput, RecUnit};

#[cfg(test)]
mod tests;
