// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nms.rs - 按类别的非极大值抑制
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

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use crate::decode::Candidate;

/// 置信度降序，相同时先解码者优先
fn by_confidence(a: &Candidate, b: &Candidate) -> Ordering {
  b.confidence
    .total_cmp(&a.confidence)
    .then_with(|| a.index.cmp(&b.index))
}

/// 非极大值抑制
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suppressor {
  iou_threshold: f32,
  max_detections: Option<usize>,
}

impl Suppressor {
  pub fn new(iou_threshold: f32, max_detections: Option<usize>) -> Self {
    Self {
      iou_threshold,
      max_detections,
    }
  }

  /// 结果按置信度降序排列，数量不超过输入
  pub fn suppress(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
    let total = candidates.len();

    let mut classes: BTreeMap<u32, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
      classes.entry(candidate.class_id).or_default().push(candidate);
    }

    let mut kept = Vec::new();
    for (_, mut boxes) in classes {
      boxes.sort_by(by_confidence);
      kept.extend(self.suppress_class(boxes));
    }

    kept.sort_by(by_confidence);
    if let Some(max) = self.max_detections {
      kept.truncate(max);
    }

    debug!("NMS: {} -> {} 个候选框", total, kept.len());
    kept
  }

  /// `boxes` 已按置信度排序且属于同一类别
  fn suppress_class(&self, boxes: Vec<Candidate>) -> Vec<Candidate> {
    let mut suppressed = vec![false; boxes.len()];
    let mut kept = Vec::new();

    for i in 0..boxes.len() {
      if suppressed[i] {
        continue;
      }
      for j in (i + 1)..boxes.len() {
        if !suppressed[j] && boxes[i].bbox.iou(&boxes[j].bbox) > self.iou_threshold {
          suppressed[j] = true;
        }
      }
      kept.push(i);
    }

    let mut boxes: Vec<Option<Candidate>> = boxes.into_iter().map(Some).collect();
    kept.into_iter().filter_map(|i| boxes[i].take()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::BBox;

  fn candidate(index: usize, class_id: u32, confidence: f32, bbox: BBox) -> Candidate {
    Candidate {
      class_id,
      confidence,
      bbox,
      index,
    }
  }

  #[test]
  fn keeps_highest_of_overlapping_pair() {
    let a = BBox::new(0.0, 0.0, 100.0, 100.0);
    let b = BBox::new(10.0, 0.0, 100.0, 100.0);
    assert!(a.iou(&b) > 0.8);

    let kept = Suppressor::new(0.5, None).suppress(vec![
      candidate(0, 0, 0.4, b),
      candidate(1, 0, 0.9, a),
    ]);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].confidence, 0.9);
  }

  #[test]
  fn other_classes_are_not_suppressed() {
    let a = BBox::new(0.0, 0.0, 100.0, 100.0);
    let kept = Suppressor::new(0.5, None).suppress(vec![
      candidate(0, 0, 0.9, a),
      candidate(1, 1, 0.8, a),
    ]);
    assert_eq!(kept.len(), 2);
  }

  #[test]
  fn distinct_objects_survive() {
    let kept = Suppressor::new(0.5, None).suppress(vec![
      candidate(0, 0, 0.9, BBox::new(0.0, 0.0, 10.0, 10.0)),
      candidate(1, 0, 0.8, BBox::new(50.0, 50.0, 10.0, 10.0)),
      candidate(2, 0, 0.7, BBox::new(1.0, 1.0, 10.0, 10.0)),
    ]);
    let indices: Vec<_> = kept.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1]);
  }

  #[test]
  fn suppression_is_not_transitive() {
    // c 与 a 不重叠，但与被抑制的 b 重叠，仍应保留
    let kept = Suppressor::new(0.3, None).suppress(vec![
      candidate(0, 0, 0.9, BBox::new(0.0, 0.0, 10.0, 10.0)),
      candidate(1, 0, 0.8, BBox::new(3.0, 0.0, 10.0, 10.0)),
      candidate(2, 0, 0.7, BBox::new(10.0, 0.0, 10.0, 10.0)),
    ]);
    let indices: Vec<_> = kept.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 2]);
  }

  #[test]
  fn ties_prefer_earlier_candidate() {
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(1.0, 0.0, 10.0, 10.0);
    let kept = Suppressor::new(0.5, None).suppress(vec![
      candidate(0, 0, 0.8, b),
      candidate(1, 0, 0.8, a),
    ]);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].index, 0);
  }

  #[test]
  fn max_detections_truncates_sorted_result() {
    let kept = Suppressor::new(0.5, Some(1)).suppress(vec![
      candidate(0, 2, 0.6, BBox::new(0.0, 0.0, 10.0, 10.0)),
      candidate(1, 0, 0.9, BBox::new(100.0, 0.0, 10.0, 10.0)),
      candidate(2, 1, 0.7, BBox::new(200.0, 0.0, 10.0, 10.0)),
    ]);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].confidence, 0.9);
  }

  #[test]
  fn zero_area_boxes_never_suppress() {
    let point = BBox::new(5.0, 5.0, 0.0, 0.0);
    let kept = Suppressor::new(0.1, None).suppress(vec![
      candidate(0, 0, 0.9, point),
      candidate(1, 0, 0.8, point),
    ]);
    assert_eq!(kept.len(), 2);
  }

  #[test]
  fn output_invariants_hold_on_dense_input() {
    let mut candidates = Vec::new();
    for i in 0..200 {
      let x = (i % 20) as f32 * 7.0;
      let y = (i / 20) as f32 * 9.0;
      let confidence = ((i * 37) % 100) as f32 / 100.0;
      candidates.push(candidate(i, (i % 3) as u32, confidence, BBox::new(x, y, 20.0, 20.0)));
    }
    let threshold = 0.45;
    let kept = Suppressor::new(threshold, None).suppress(candidates.clone());

    assert!(kept.len() <= candidates.len());
    for (i, a) in kept.iter().enumerate() {
      for b in &kept[i + 1..] {
        if a.class_id == b.class_id {
          assert!(a.bbox.iou(&b.bbox) <= threshold);
        }
      }
    }
    assert!(kept.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    assert_eq!(kept, Suppressor::new(threshold, None).suppress(candidates));
  }

  #[test]
  fn empty_input() {
    assert!(Suppressor::new(0.5, Some(10)).suppress(Vec::new()).is_empty());
  }
}
