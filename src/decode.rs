// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode.rs - 检测头解码
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{error::ModelLoadError, geometry::BBox, tensor::Tensor};

/// 检测头输出格式，在加载模型时根据元数据确定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeadFormat {
  /// YOLOv5/v7: 单输出 [1, N, 5 + C]，每行为 cx, cy, w, h, objectness, 各类别分数
  AnchorBased {
    num_classes: usize,
    #[serde(default)]
    normalized_boxes: bool,
  },
  /// YOLOv8/v11: 单输出 [1, 4 + C, N]，按通道排布，无 objectness
  AnchorFree {
    num_classes: usize,
    #[serde(default)]
    normalized_boxes: bool,
  },
  /// YOLO26 (NPU 导出): 每个步长一对输出，回归 [1, 4, H, W] 与分类 [1, C, H, W]
  SplitHead { num_classes: usize, strides: Vec<u32> },
}

impl HeadFormat {
  pub fn num_classes(&self) -> usize {
    match self {
      HeadFormat::AnchorBased { num_classes, .. }
      | HeadFormat::AnchorFree { num_classes, .. }
      | HeadFormat::SplitHead { num_classes, .. } => *num_classes,
    }
  }

  /// 检查模型声明的输出形状与检测头格式是否一致
  pub fn validate_outputs(
    &self,
    outputs: &[Vec<usize>],
    input_width: usize,
    input_height: usize,
  ) -> Result<(), String> {
    let nc = self.num_classes();
    if nc == 0 {
      return Err("类别数量不能为 0".to_string());
    }

    match self {
      HeadFormat::AnchorBased { .. } => match outputs {
        [shape] if matches!(shape.as_slice(), &[1, n, row] if n > 0 && row == 5 + nc) => Ok(()),
        _ => Err(format!("anchor_based 需要单个 [1, N, {}] 输出, 实际 {:?}", 5 + nc, outputs)),
      },
      HeadFormat::AnchorFree { .. } => match outputs {
        [shape] if matches!(shape.as_slice(), &[1, ch, n] if n > 0 && ch == 4 + nc) => Ok(()),
        _ => Err(format!("anchor_free 需要单个 [1, {}, N] 输出, 实际 {:?}", 4 + nc, outputs)),
      },
      HeadFormat::SplitHead { strides, .. } => {
        if strides.is_empty() || outputs.len() != strides.len() * 2 {
          return Err(format!(
            "split_head 需要 {} 个输出, 实际 {} 个",
            strides.len() * 2,
            outputs.len()
          ));
        }
        for (head_idx, &stride) in strides.iter().enumerate() {
          let stride = stride as usize;
          if stride == 0 || input_width % stride != 0 || input_height % stride != 0 {
            return Err(format!("检测头 {} 的步长 {} 无法整除输入尺寸", head_idx, stride));
          }
          let (gh, gw) = (input_height / stride, input_width / stride);
          let reg = [1, 4, gh, gw];
          let cls = [1, nc, gh, gw];
          let pair = (&outputs[head_idx * 2][..], &outputs[head_idx * 2 + 1][..]);
          if pair != (&reg[..], &cls[..]) && pair != (&cls[..], &reg[..]) {
            return Err(format!(
              "检测头 {} 期望输出 {:?} 与 {:?}, 实际 {:?} 与 {:?}",
              head_idx, reg, cls, pair.0, pair.1
            ));
          }
        }
        Ok(())
      }
    }
  }
}

/// 解码得到的候选框，坐标位于模型输入空间
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
  pub class_id: u32,
  pub confidence: f32,
  pub bbox: BBox,
  /// 解码输出中的顺序，用于置信度相同时的排序
  pub index: usize,
}

/// 将原始输出张量解码为候选框
#[derive(Debug, Clone)]
pub struct Decoder {
  head: HeadFormat,
  input_width: f32,
  input_height: f32,
  confidence_threshold: f32,
}

impl Decoder {
  /// 分离检测头的步长必须非零，否则网格尺寸无从计算
  pub fn new(
    head: HeadFormat,
    input_width: usize,
    input_height: usize,
    confidence_threshold: f32,
  ) -> Result<Self, ModelLoadError> {
    if let HeadFormat::SplitHead { strides, .. } = &head
      && let Some(head_idx) = strides.iter().position(|&stride| stride == 0)
    {
      return Err(ModelLoadError::Invalid(format!(
        "检测头 {} 的步长为 0",
        head_idx
      )));
    }
    Ok(Self {
      head,
      input_width: input_width as f32,
      input_height: input_height as f32,
      confidence_threshold,
    })
  }

  pub fn head(&self) -> &HeadFormat {
    &self.head
  }

  pub fn decode(&self, outputs: &[Tensor]) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    match &self.head {
      HeadFormat::AnchorBased {
        num_classes,
        normalized_boxes,
      } => self.decode_anchor_based(outputs, *num_classes, *normalized_boxes, &mut candidates),
      HeadFormat::AnchorFree {
        num_classes,
        normalized_boxes,
      } => self.decode_anchor_free(outputs, *num_classes, *normalized_boxes, &mut candidates),
      HeadFormat::SplitHead {
        num_classes,
        strides,
      } => self.decode_split_head(outputs, *num_classes, strides, &mut candidates),
    }
    debug!("解码得到 {} 个候选框", candidates.len());
    candidates
  }

  fn box_scale(&self, normalized: bool) -> (f32, f32) {
    if normalized {
      (self.input_width, self.input_height)
    } else {
      (1.0, 1.0)
    }
  }

  fn emit(&self, out: &mut Vec<Candidate>, class_id: usize, confidence: f32, bbox: BBox) {
    if !confidence.is_finite() || !bbox.is_finite() {
      return;
    }
    let confidence = confidence.clamp(0.0, 1.0);
    if confidence <= self.confidence_threshold {
      return;
    }
    out.push(Candidate {
      class_id: class_id as u32,
      confidence,
      bbox,
      index: out.len(),
    });
  }

  fn decode_anchor_based(
    &self,
    outputs: &[Tensor],
    nc: usize,
    normalized: bool,
    out: &mut Vec<Candidate>,
  ) {
    let Some(data) = single_f32(outputs) else {
      return;
    };
    let row = 5 + nc;
    if data.len() % row != 0 {
      error!("输出长度 {} 不是行宽 {} 的整数倍", data.len(), row);
      return;
    }

    let (kx, ky) = self.box_scale(normalized);
    for cell in data.chunks_exact(row) {
      let objectness = cell[4];
      if !objectness.is_finite() {
        continue;
      }
      let objectness = objectness.clamp(0.0, 1.0);
      if objectness <= self.confidence_threshold {
        continue;
      }

      let bbox = BBox::from_center(cell[0] * kx, cell[1] * ky, cell[2] * kx, cell[3] * ky);
      for (class_id, &score) in cell[5..].iter().enumerate() {
        self.emit(out, class_id, objectness * score.clamp(0.0, 1.0), bbox);
      }
    }
  }

  fn decode_anchor_free(
    &self,
    outputs: &[Tensor],
    nc: usize,
    normalized: bool,
    out: &mut Vec<Candidate>,
  ) {
    let Some(data) = single_f32(outputs) else {
      return;
    };
    let channels = 4 + nc;
    if data.len() % channels != 0 {
      error!("输出长度 {} 不是通道数 {} 的整数倍", data.len(), channels);
      return;
    }

    let n = data.len() / channels;
    let at = |ch: usize, i: usize| data[ch * n + i];
    let (kx, ky) = self.box_scale(normalized);
    for i in 0..n {
      let bbox = BBox::from_center(at(0, i) * kx, at(1, i) * ky, at(2, i) * kx, at(3, i) * ky);
      for class_id in 0..nc {
        self.emit(out, class_id, at(4 + class_id, i), bbox);
      }
    }
  }

  fn decode_split_head(
    &self,
    outputs: &[Tensor],
    nc: usize,
    strides: &[u32],
    out: &mut Vec<Candidate>,
  ) {
    for (head_idx, &stride) in strides.iter().enumerate() {
      let map_h = (self.input_height as u32 / stride) as usize;
      let map_w = (self.input_width as u32 / stride) as usize;
      let spatial = map_h * map_w;

      let (Some(t1), Some(t2)) = (
        outputs.get(head_idx * 2).and_then(Tensor::as_f32),
        outputs.get(head_idx * 2 + 1).and_then(Tensor::as_f32),
      ) else {
        error!("检测头 {}: 缺少浮点输出", head_idx);
        continue;
      };

      // 输出顺序可能不同，根据张量大小区分回归与分类
      let (reg, cls) = if t1.len() == 4 * spatial && t2.len() == nc * spatial {
        (t1, t2)
      } else if t1.len() == nc * spatial && t2.len() == 4 * spatial {
        debug!("检测头 {}: 输出顺序交换", head_idx);
        (t2, t1)
      } else {
        error!(
          "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 空间大小: {}",
          head_idx,
          t1.len(),
          t2.len(),
          spatial
        );
        continue;
      };

      let stride = stride as f32;
      for h in 0..map_h {
        for w in 0..map_w {
          let idx = h * map_w + w;
          let grid_x = w as f32 + 0.5;
          let grid_y = h as f32 + 0.5;

          let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, self.input_width);
          let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, self.input_height);
          let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, self.input_width);
          let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, self.input_height);
          let bbox = BBox::from_xyxy(xmin, ymin, xmax, ymax);

          for class_id in 0..nc {
            self.emit(out, class_id, sigmoid(cls[class_id * spatial + idx]), bbox);
          }
        }
      }
    }
  }
}

fn single_f32(outputs: &[Tensor]) -> Option<&[f32]> {
  match outputs.first().map(Tensor::as_f32) {
    Some(Some(data)) => Some(data),
    Some(None) => {
      error!("检测头输出不是浮点张量");
      None
    }
    None => {
      error!("缺少检测头输出");
      None
    }
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
