/*
 * @Author       : 老董
 * @Date         : 2026-02-06
 * @Description  : 固定循环单元：单元数学与静态注册表
 *
 * 所有单元都把门拼在一起存放：`W: [n_in, g*n]`、`U: [n, g*n]`、`b: [g*n]`，
 * 其中g为门数（RNN 1、GRU 3、LSTM 4）。
 *
 * RNN:  h_t = tanh(x W + h U + b)
 * GRU（门序r, z, n）:
 *   r_t = σ(x W_r + h U_r + b_r)
 *   z_t = σ(x W_z + h U_z + b_z)
 *   n_t = tanh(x W_n + b_n + r_t ⊙ (h U_n))
 *   h_t = (1 - z_t) ⊙ n_t + z_t ⊙ h_{t-1}
 * LSTM（门序i, f, g, o；状态为`concat(c, h)`）:
 *   c_t = σ(f) ⊙ c_{t-1} + σ(i) ⊙ tanh(g)
 *   h_t = σ(o) ⊙ tanh(c_t)
 */

use tracing::info;

use crate::errors::RecError;
use crate::nn::{Init, ParamStore};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Rnn,
    Gru,
    Lstm,
}

impl CellType {
    pub fn gates(&self) -> usize {
        match self {
            Self::Rnn => 1,
            Self::Gru => 3,
            Self::Lstm => 4,
        }
    }

    /// 状态宽度：LSTM的状态是`concat(c, h)`
    pub fn state_size(&self, n: usize) -> usize {
        match self {
            Self::Lstm => 2 * n,
            _ => n,
        }
    }

    pub fn create_params(
        &self,
        prefix: &str,
        n_in: usize,
        n: usize,
        params: &mut ParamStore,
    ) -> Result<(), RecError> {
        let width = self.gates() * n;
        params.create(&format!("{}/W", prefix), &[n_in, width], Init::Xavier)?;
        params.create(&format!("{}/U", prefix), &[n, width], Init::Xavier)?;
        let mut bias = vec![0.0; width];
        if *self == Self::Lstm {
            // 遗忘门偏置初始化为1
            bias[n..2 * n].fill(1.0);
        }
        params.create_with_value(&format!("{}/b", prefix), Tensor::try_new(bias, &[width])?)?;
        Ok(())
    }

    /// 单步更新。`x_proj`为已算好的`x W + b`（`[rows, g*n]`），返回`(输出, 新状态)`
    pub fn step(
        &self,
        x_proj: &Tensor,
        state: &Tensor,
        u: &Tensor,
        n: usize,
    ) -> Result<(Tensor, Tensor), RecError> {
        match self {
            Self::Rnn => {
                let h = x_proj.add(&state.mat_mul(u)?)?.tanh();
                Ok((h.clone(), h))
            }
            Self::Gru => {
                let h_u = state.mat_mul(u)?;
                let gate = |k: usize, t: &Tensor| t.slice_last(k * n..(k + 1) * n);
                let r = gate(0, x_proj)?.add(&gate(0, &h_u)?)?.sigmoid();
                let z = gate(1, x_proj)?.add(&gate(1, &h_u)?)?.sigmoid();
                let cand = gate(2, x_proj)?.add(&r.mul(&gate(2, &h_u)?)?)?.tanh();
                let one_minus_z = z.map(|v| 1.0 - v);
                let h = one_minus_z.mul(&cand)?.add(&z.mul(state)?)?;
                Ok((h.clone(), h))
            }
            Self::Lstm => {
                let c_prev = state.slice_last(0..n)?;
                let h_prev = state.slice_last(n..2 * n)?;
                let z = x_proj.add(&h_prev.mat_mul(u)?)?;
                let gate = |k: usize| z.slice_last(k * n..(k + 1) * n);
                let (i, f) = (gate(0)?.sigmoid(), gate(1)?.sigmoid());
                let (g, o) = (gate(2)?.tanh(), gate(3)?.sigmoid());
                let c = f.mul(&c_prev)?.add(&i.mul(&g)?)?;
                let h = o.mul(&c.tanh())?;
                let state = Tensor::concat_last(&[&c, &h])?;
                Ok((h, state))
            }
        }
    }
}

/// 一个注册名对应的执行策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellImpl {
    /// 逐步调用单元
    Generic(CellType),
    /// 整段序列先做输入投影，再做融合的门递推（LSTM）
    NativeLstm,
    /// 可多层堆叠的整段融合核
    BlockFused(CellType),
}

impl CellImpl {
    pub fn cell_type(&self) -> CellType {
        match self {
            Self::Generic(cell) | Self::BlockFused(cell) => *cell,
            Self::NativeLstm => CellType::Lstm,
        }
    }
}

/// 静态注册表（名字均为小写）
const CELL_TABLE: &[(&str, CellImpl)] = &[
    ("rnn", CellImpl::Generic(CellType::Rnn)),
    ("basicrnn", CellImpl::Generic(CellType::Rnn)),
    ("gru", CellImpl::Generic(CellType::Gru)),
    ("grublock", CellImpl::Generic(CellType::Gru)),
    ("basiclstm", CellImpl::Generic(CellType::Lstm)),
    ("standardlstm", CellImpl::Generic(CellType::Lstm)),
    ("lstmblock", CellImpl::Generic(CellType::Lstm)),
    ("nativelstm", CellImpl::NativeLstm),
    ("lstmblockfused", CellImpl::BlockFused(CellType::Lstm)),
];

/// 别名 -> 注册名。默认的`lstm`指向最快的实现；GPU专用单元回落到CPU上的对应实现
const CELL_ALIASES: &[(&str, &str)] = &[
    ("lstm", "nativelstm"),
    ("lstmp", "nativelstm"),
    ("cudnnlstm", "lstmblockfused"),
    ("cudnngru", "gru"),
];

/// 按名字（不区分大小写）查找单元，返回`(注册名, 策略)`；经别名替换时记录一条日志
pub fn lookup_cell(name: &str) -> Result<(&'static str, CellImpl), RecError> {
    let (registered, cell) =
        resolve_cell(name).ok_or_else(|| RecError::UnknownCell(name.to_string()))?;
    if !registered.eq_ignore_ascii_case(name) {
        info!(requested = name, resolved = registered, "循环单元名按别名替换");
    }
    Ok((registered, cell))
}

/// 同[`lookup_cell`]，但不记录日志（逐步调用时使用）
pub(crate) fn resolve_cell(name: &str) -> Option<(&'static str, CellImpl)> {
    let lower = name.to_lowercase();
    let canonical = CELL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map_or(lower.as_str(), |(_, target)| *target);
    CELL_TABLE
        .iter()
        .find(|(registered, _)| *registered == canonical)
        .map(|(registered, cell)| (*registered, *cell))
}

/// 所有可用的单元名（含别名）
pub fn cell_names() -> Vec<&'static str> {
    let mut names = CELL_TABLE
        .iter()
        .map(|(name, _)| *name)
        .chain(CELL_ALIASES.iter().map(|(alias, _)| *alias))
        .collect::<Vec<_>>();
    names.sort_unstable();
    names
}
