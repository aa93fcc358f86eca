/*
 * @Author       : 老董
 * @Date         : 2026-02-09
 * @Description  : 束搜索（beam search）协调器
 *
 * 行的约定：带束的张量第0维为`batch*beam`，第`b`个样本的第`k`个假设位于第`b*beam + k`行。
 *
 * 一个时间步内可以有多个“束帧”（beam frame）：帧0是上一步传入的假设集合，
 * 每经过一个选择点就产生一个新帧，并记录新帧每一行来自上一帧的哪一行（`src_beams`）。
 * 不同帧的值在参与同一层计算前，先沿记录的`src_beams`重排（gather）到最新的帧上。
 */

use crate::errors::RecError;
use crate::tensor::Tensor;

/// 一个束帧
#[derive(Debug, Clone)]
struct Frame {
    beam: usize,
    /// 本帧每一行在上一帧中的行号；帧0为None
    parents: Option<Vec<usize>>,
}

/// 一个时间步内的束帧序列
#[derive(Debug, Clone)]
pub struct BeamFrames {
    batch: usize,
    frames: Vec<Frame>,
}

/// 值所在的帧：`None`表示不带束（每个样本一行，如父网络层、外部数据、步号）
pub type FrameId = Option<usize>;

impl BeamFrames {
    pub fn new(batch: usize, beam: usize) -> Self {
        Self {
            batch,
            frames: vec![Frame {
                beam,
                parents: None,
            }],
        }
    }

    /// 最新的帧
    pub fn current(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn beam(&self, frame: usize) -> usize {
        self.frames.get(frame).map_or(1, |f| f.beam)
    }

    pub fn rows(&self, frame: FrameId) -> usize {
        match frame {
            Some(f) => self.batch * self.beam(f),
            None => self.batch,
        }
    }

    /// 经选择点产生新帧，返回其编号
    pub fn push(&mut self, beam: usize, parents: Vec<usize>) -> usize {
        self.frames.push(Frame {
            beam,
            parents: Some(parents),
        });
        self.current()
    }

    /// 把`from`帧上的值重排到`to`帧（`to`须不早于`from`）
    pub fn align(&self, value: &Tensor, from: FrameId, to: FrameId) -> Result<Tensor, RecError> {
        match (from, to) {
            (None, None) => Ok(value.clone()),
            (None, Some(t)) => Ok(value.tile_rows(self.beam(t))?),
            (Some(f), Some(t)) if f == t => Ok(value.clone()),
            (Some(f), Some(t)) if f < t => Ok(value.gather_rows(&self.composite(f, t))?),
            _ => Err(RecError::Config(format!(
                "无法把帧{:?}上的值对齐到更早的帧{:?}",
                from, to
            ))),
        }
    }

    /// `to`帧每一行在`from`帧中的祖先行号
    pub fn composite(&self, from: usize, to: usize) -> Vec<usize> {
        let mut rows = (0..self.rows(Some(to))).collect::<Vec<_>>();
        for frame in self.frames[from + 1..=to].iter().rev() {
            if let Some(parents) = &frame.parents {
                rows = rows.iter().map(|&r| parents[r]).collect();
            }
        }
        rows
    }

    /// 按帧重排逐行的标志/计数
    pub fn align_rows<T: Copy>(&self, values: &[T], from: usize, to: usize) -> Vec<T> {
        self.composite(from, to).iter().map(|&r| values[r]).collect()
    }

    /// `to`帧每一行所属的样本
    pub fn row_batches(&self, frame: FrameId) -> Vec<usize> {
        let beam = frame.map_or(1, |f| self.beam(f));
        (0..self.rows(frame)).map(|r| r / beam).collect()
    }

    /// 最新帧相对帧0的各选择点的`src_beams`（按选择点顺序）
    pub fn chain(&self) -> Vec<Vec<usize>> {
        self.frames.iter().filter_map(|f| f.parents.clone()).collect()
    }
}

/// 一次选择的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceStep {
    /// 新的假设分数`[batch, beam_out]`
    pub scores: Tensor,
    /// 每个新假设来自上一帧的行号（长度`batch*beam_out`）
    pub src_beams: Vec<usize>,
    /// 每个新假设本步选中的标签
    pub labels: Vec<usize>,
}

/// 束帧`beam_scores [batch, K_in]`加上每个假设对D个候选的对数分数`log_probs [batch*K_in, D]`，
/// 在每个样本的`K_in*D`个组合里取最高的`beam_out`个。
/// 并列时扁平下标（`j*D + d`）小者在前，结果是确定的。
///
/// `ended`（按`batch*K_in`行，可为空）标记已结束的假设：它们经`filter_ended`后只剩一个候选，
/// 这个候选不参与竞争、直接保留，活着的假设只争夺剩下的名额
pub fn select_top_k(
    beam_scores: &Tensor,
    log_probs: &Tensor,
    beam_out: usize,
    ended: &[bool],
) -> Result<ChoiceStep, RecError> {
    let (batch, beam_in) = (beam_scores.shape()[0], beam_scores.shape()[1]);
    let dim = log_probs.shape()[1];
    if log_probs.rows() != batch * beam_in {
        return Err(RecError::ShapeMismatch {
            layer: "beam".to_string(),
            expected: vec![batch * beam_in, dim],
            got: log_probs.shape().to_vec(),
        });
    }
    // [batch*K_in, D] + [batch*K_in, 1] -> 展平为[batch, K_in*D]
    let combined = log_probs
        .add(&beam_scores.reshape(&[batch * beam_in, 1])?)?
        .reshape(&[batch, beam_in * dim])?;
    let reserved = ended
        .iter()
        .flat_map(|&e| std::iter::repeat_n(e, dim))
        .collect::<Vec<_>>();
    let (scores, indices) = combined.top_k_rows(beam_out, &reserved)?;
    let mut src_beams = Vec::with_capacity(batch * beam_out);
    let mut labels = Vec::with_capacity(batch * beam_out);
    for (b, row) in indices.iter().enumerate() {
        for &flat in row {
            src_beams.push(b * beam_in + flat / dim);
            labels.push(flat % dim);
        }
    }
    Ok(ChoiceStep {
        scores,
        src_beams,
        labels,
    })
}

/// 已结束的假设只保留一个候选：沿用上一步的标签，分数增量为0；其余候选置为`-inf`
pub fn filter_ended(
    log_probs: &Tensor,
    ended: &[bool],
    prev_labels: &[usize],
) -> Result<Tensor, RecError> {
    if !ended.iter().any(|&e| e) {
        return Ok(log_probs.clone());
    }
    let (rows, dim) = (log_probs.shape()[0], log_probs.shape()[1]);
    let mut frozen = vec![f32::NEG_INFINITY; rows * dim];
    for (r, &label) in prev_labels.iter().enumerate().take(rows) {
        if label < dim {
            frozen[r * dim + label] = 0.0;
        }
    }
    let frozen = Tensor::try_new(frozen, &[rows, dim])?;
    Ok(Tensor::where_rows(ended, &frozen, log_probs)?)
}

/// 第0步之前的假设分数：每个样本只有第0个假设是“活”的，其余为`-inf`，
/// 这样第0步的top-K不会选出重复的假设
pub fn initial_scores(batch: usize, beam: usize) -> Result<Tensor, RecError> {
    let data = (0..batch * beam)
        .map(|i| if i % beam == 0 { 0.0 } else { f32::NEG_INFINITY })
        .collect::<Vec<_>>();
    Ok(Tensor::try_new(data, &[batch, beam])?)
}

/// 循环结束后的路径回溯。
///
/// `outputs[t]`为第t步按“槽位”累积的输出（`[batch*beam, ...]`），
/// `parents[t]`为第t步各选择点依次记录的`src_beams`。
/// 从最后一步的假设0..K-1出发逐步向前，按记录的父行号把每一步的输出重排成与最终假设一致的序列
pub fn resolve_paths(
    outputs: &[Tensor],
    parents: &[Vec<Vec<usize>>],
) -> Result<Vec<Tensor>, RecError> {
    let Some(last) = outputs.last() else {
        return Ok(Vec::new());
    };
    if outputs.len() != parents.len() {
        return Err(RecError::LengthMismatch {
            expected: outputs.len(),
            got: parents.len(),
            message: "每一步都须记录父行号".to_string(),
        });
    }
    let mut rows = (0..last.rows()).collect::<Vec<_>>();
    let mut resolved = vec![None; outputs.len()];
    for t in (0..outputs.len()).rev() {
        resolved[t] = Some(outputs[t].gather_rows(&rows)?);
        for src_beams in parents[t].iter().rev() {
            rows = rows.iter().map(|&r| src_beams[r]).collect();
        }
    }
    Ok(resolved.into_iter().flatten().collect())
}

/// 每个样本按分数挑出的最佳假设
#[derive(Debug, Clone, PartialEq)]
pub struct Decided {
    /// `[T, batch, ...]`
    pub output: Tensor,
    pub seq_lens: Vec<usize>,
    /// 每个样本最佳假设的累计对数分数
    pub scores: Vec<f32>,
    /// 每个样本最佳假设的束内下标
    pub beam_indices: Vec<usize>,
}

/// 按样本取分数最高的假设（并列取下标最小者），并从已回溯的输出`[T, batch*beam, ...]`中取出其序列
pub fn decide(output: &Tensor, scores: &Tensor, seq_lens: &[usize]) -> Result<Decided, RecError> {
    let beam = scores.shape()[1];
    let beam_indices = scores.argmax_rows()?;
    let rows = beam_indices
        .iter()
        .enumerate()
        .map(|(b, &k)| b * beam + k)
        .collect::<Vec<_>>();
    let best_scores = rows
        .iter()
        .map(|&r| scores.value(&[r / beam, r % beam]).unwrap_or(f32::NEG_INFINITY))
        .collect::<Vec<_>>();
    let time_major = output.swap_time_batch()?.gather_rows(&rows)?.swap_time_batch()?;
    Ok(Decided {
        output: time_major,
        seq_lens: rows.iter().map(|&r| seq_lens[r]).collect(),
        scores: best_scores,
        beam_indices,
    })
}
