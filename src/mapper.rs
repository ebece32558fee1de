// 该文件是 Shanan （山南西风） 项目的一部分。
// src/mapper.rs - 坐标映射
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

use serde::Serialize;

use crate::{decode::Candidate, geometry::BBox};

/// 模型输入坐标到原图坐标的仿射变换
///
/// 模型坐标 = 原图坐标 * scale + offset，因此
/// 原图坐标 = (模型坐标 - offset) / scale。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
  pub sx: f32,
  pub sy: f32,
  pub ox: f32,
  pub oy: f32,
}

impl AffineTransform {
  pub const IDENTITY: AffineTransform = AffineTransform {
    sx: 1.0,
    sy: 1.0,
    ox: 0.0,
    oy: 0.0,
  };

  pub fn new(sx: f32, sy: f32, ox: f32, oy: f32) -> Self {
    Self { sx, sy, ox, oy }
  }

  /// 映射回原图坐标，结果限制在 `[0, frame_width] x [0, frame_height]` 内
  pub fn to_original(&self, bbox: &BBox, frame_width: u32, frame_height: u32) -> BBox {
    let w = frame_width as f32;
    let h = frame_height as f32;
    let x_min = clamp_axis((bbox.x - self.ox) / self.sx, w);
    let y_min = clamp_axis((bbox.y - self.oy) / self.sy, h);
    let x_max = clamp_axis((bbox.right() - self.ox) / self.sx, w);
    let y_max = clamp_axis((bbox.bottom() - self.oy) / self.sy, h);
    BBox::from_xyxy(x_min, y_min, x_max.max(x_min), y_max.max(y_min))
  }

  /// 原图坐标映射到模型输入坐标，不做裁剪
  pub fn to_model(&self, bbox: &BBox) -> BBox {
    BBox::from_xyxy(
      bbox.x * self.sx + self.ox,
      bbox.y * self.sy + self.oy,
      bbox.right() * self.sx + self.ox,
      bbox.bottom() * self.sy + self.oy,
    )
  }
}

fn clamp_axis(value: f32, bound: f32) -> f32 {
  if value.is_nan() {
    0.0
  } else {
    value.clamp(0.0, bound.max(0.0))
  }
}

/// 最终检测结果，坐标位于原图空间
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub class_id: u32,
  pub confidence: f32,
  pub bbox: BBox,
}

/// 将抑制后的候选框映射为原图坐标下的检测结果
pub fn map_candidates(
  candidates: &[Candidate],
  transform: &AffineTransform,
  frame_width: u32,
  frame_height: u32,
) -> Vec<Detection> {
  candidates
    .iter()
    .map(|c| Detection {
      class_id: c.class_id,
      confidence: c.confidence,
      bbox: transform.to_original(&c.bbox, frame_width, frame_height),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn close(a: &BBox, b: &BBox) -> bool {
    (a.x - b.x).abs() < 1e-3
      && (a.y - b.y).abs() < 1e-3
      && (a.width - b.width).abs() < 1e-3
      && (a.height - b.height).abs() < 1e-3
  }

  #[test]
  fn round_trip_model_original_model() {
    // 1280x720 letterbox 到 640x640
    let t = AffineTransform::new(0.5, 0.5, 0.0, 140.0);
    let model_box = BBox::new(100.0, 200.0, 64.0, 32.0);
    let original = t.to_original(&model_box, 1280, 720);
    assert!(close(&original, &BBox::new(200.0, 120.0, 128.0, 64.0)));
    assert!(close(&t.to_model(&original), &model_box));
  }

  #[test]
  fn clamps_to_frame_bounds() {
    let t = AffineTransform::new(0.5, 0.5, 0.0, 140.0);
    // 落在上方填充区并越过右边界
    let model_box = BBox::new(600.0, 100.0, 80.0, 100.0);
    let original = t.to_original(&model_box, 1280, 720);
    assert_eq!(original.y, 0.0);
    assert_eq!(original.right(), 1280.0);
    assert!(original.width >= 0.0 && original.height >= 0.0);
  }

  #[test]
  fn degenerate_transform_never_panics() {
    let t = AffineTransform::new(0.0, f32::NAN, 0.0, 0.0);
    let original = t.to_original(&BBox::new(1.0, 1.0, 2.0, 2.0), 100, 100);
    assert!(original.is_finite());
    assert!(original.x >= 0.0 && original.right() <= 100.0);
  }

  #[test]
  fn identity_keeps_candidates() {
    let candidates = [Candidate {
      class_id: 2,
      confidence: 0.8,
      bbox: BBox::new(1.0, 2.0, 3.0, 4.0),
      index: 0,
    }];
    let detections = map_candidates(&candidates, &AffineTransform::IDENTITY, 10, 10);
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].bbox, BBox::new(1.0, 2.0, 3.0, 4.0));
    assert_eq!(detections[0].class_id, 2);
  }
}
