/*
 * @Author       : 老董
 * @Date         : 2026-02-06
 * @Description  : 固定单元在整段序列上的执行策略
 *
 * - 逐步（generic）：每一步先算`x_t W + b`再调用单元
 * - 融合（fused）：先对整段序列一次性做输入投影`[T*B, n_in] @ W`，再逐步做门递推；
 *   多层融合核把上一层的整段输出作为下一层的输入
 *
 * 超出样本有效长度的步：状态冻结，输出置0。
 */

use tracing::debug;

use super::cells::CellType;
use crate::errors::RecError;
use crate::nn::ParamStore;
use crate::tensor::Tensor;

/// 一层单元的参数
pub struct CellWeights<'a> {
    pub w: &'a Tensor,
    pub u: &'a Tensor,
    pub b: &'a Tensor,
}

impl<'a> CellWeights<'a> {
    pub fn load(params: &'a ParamStore, prefix: &str) -> Result<Self, RecError> {
        Ok(Self {
            w: params.get(&format!("{}/W", prefix))?,
            u: params.get(&format!("{}/U", prefix))?,
            b: params.get(&format!("{}/b", prefix))?,
        })
    }
}

/// 整段序列的运行结果
pub struct SeqRun {
    /// `[T, B, n]`
    pub output: Tensor,
    /// `[B, state_size]`
    pub last_state: Tensor,
}

/// 逐步执行：`x`为`[T, B, n_in]`
pub fn run_generic(
    cell: CellType,
    n: usize,
    x: &Tensor,
    seq_lens: &[usize],
    initial_state: Tensor,
    weights: &CellWeights<'_>,
) -> Result<SeqRun, RecError> {
    let frames = x.unstack();
    let projections = frames
        .iter()
        .map(|x_t| Ok(x_t.mat_mul(weights.w)?.add(weights.b)?))
        .collect::<Result<Vec<_>, RecError>>()?;
    recur(cell, n, &projections, seq_lens, initial_state, weights.u)
}

/// 融合执行：整段输入投影只做一次矩阵乘
pub fn run_fused(
    cell: CellType,
    n: usize,
    x: &Tensor,
    seq_lens: &[usize],
    initial_state: Tensor,
    weights: &CellWeights<'_>,
) -> Result<SeqRun, RecError> {
    let (time, batch) = (x.shape()[0], x.shape()[1]);
    let n_in = x.shape()[2];
    let width = cell.gates() * n;
    let projections = if time == 0 {
        Vec::new()
    } else {
        x.reshape(&[time * batch, n_in])?
            .mat_mul(weights.w)?
            .add(weights.b)?
            .reshape(&[time, batch, width])?
            .unstack()
    };
    recur(cell, n, &projections, seq_lens, initial_state, weights.u)
}

/// 多层融合：第l层参数前缀为`<prefix>/layer<l>`，各层初始状态相同，
/// 返回的最终状态为各层最终状态沿最后一维的拼接
pub fn run_multi_layer(
    cell: CellType,
    n: usize,
    num_layers: usize,
    x: &Tensor,
    seq_lens: &[usize],
    initial_state: &Tensor,
    params: &ParamStore,
    prefix: &str,
) -> Result<SeqRun, RecError> {
    let mut input = x.clone();
    let mut states = Vec::with_capacity(num_layers);
    for layer in 0..num_layers {
        let weights = CellWeights::load(params, &format!("{}/layer{}", prefix, layer))?;
        let run = run_fused(cell, n, &input, seq_lens, initial_state.clone(), &weights)?;
        debug!(layer, "融合核完成一层");
        input = run.output;
        states.push(run.last_state);
    }
    let last_state = Tensor::concat_last(&states.iter().collect::<Vec<_>>())?;
    Ok(SeqRun {
        output: input,
        last_state,
    })
}

fn recur(
    cell: CellType,
    n: usize,
    projections: &[Tensor],
    seq_lens: &[usize],
    initial_state: Tensor,
    u: &Tensor,
) -> Result<SeqRun, RecError> {
    let batch = seq_lens.len();
    let mut state = initial_state;
    let mut outputs = Vec::with_capacity(projections.len());
    let zeros = Tensor::zeros(&[batch, n]);
    for (t, x_proj) in projections.iter().enumerate() {
        let (out, next) = cell.step(x_proj, &state, u, n)?;
        let active = seq_lens.iter().map(|&len| t < len).collect::<Vec<_>>();
        state = Tensor::where_rows(&active, &next, &state)?;
        outputs.push(Tensor::where_rows(&active, &out, &zeros)?);
    }
    let output = if outputs.is_empty() {
        Tensor::zeros(&[0, batch, n])
    } else {
        Tensor::stack(&outputs)?
    };
    Ok(SeqRun {
        output,
        last_state: state,
    })
}
