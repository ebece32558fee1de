// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 边界框与 IoU
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

/// 轴对齐边界框，(x, y) 为左上角
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BBox {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 由中心点与宽高构造
  pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
    Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
  }

  /// 由 [x_min, y_min, x_max, y_max] 构造
  pub fn from_xyxy(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    Self::new(x_min, y_min, x_max - x_min, y_max - y_min)
  }

  pub fn right(&self) -> f32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> f32 {
    self.y + self.height
  }

  pub fn is_finite(&self) -> bool {
    self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
  }

  /// 面积，宽或高非正时为 0
  pub fn area(&self) -> f32 {
    if self.width > 0.0 && self.height > 0.0 {
      self.width * self.height
    } else {
      0.0
    }
  }

  pub fn intersection_area(&self, other: &BBox) -> f32 {
    let x1 = self.x.max(other.x);
    let y1 = self.y.max(other.y);
    let x2 = self.right().min(other.right());
    let y2 = self.bottom().min(other.bottom());
    (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
  }

  /// 计算两个边界框的 IoU，任一面积为零时返回 0
  pub fn iou(&self, other: &BBox) -> f32 {
    let area_a = self.area();
    let area_b = other.area();
    if area_a <= 0.0 || area_b <= 0.0 {
      return 0.0;
    }

    let intersection = self.intersection_area(other);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
      (intersection / union).clamp(0.0, 1.0)
    } else {
      0.0
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_with_itself_is_one() {
    let a = BBox::new(12.5, 3.0, 40.0, 22.0);
    assert!((a.iou(&a) - 1.0).abs() < 1e-6);
  }

  #[test]
  fn disjoint_boxes_have_zero_iou() {
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(20.0, 20.0, 10.0, 10.0);
    assert_eq!(a.iou(&b), 0.0);

    // 仅共享一条边
    let c = BBox::new(10.0, 0.0, 10.0, 10.0);
    assert_eq!(a.iou(&c), 0.0);
  }

  #[test]
  fn zero_area_box_has_zero_iou() {
    let a = BBox::new(5.0, 5.0, 0.0, 10.0);
    assert_eq!(a.iou(&a), 0.0);
    assert_eq!(a.iou(&BBox::new(0.0, 0.0, 20.0, 20.0)), 0.0);
  }

  #[test]
  fn partial_overlap() {
    let a = BBox::new(0.0, 0.0, 100.0, 100.0);
    let b = BBox::new(10.0, 0.0, 100.0, 100.0);
    // 交集 9000, 并集 11000
    assert!((a.iou(&b) - 9000.0 / 11000.0).abs() < 1e-6);
    assert_eq!(a.iou(&b), b.iou(&a));
  }

  #[test]
  fn constructors_agree() {
    let a = BBox::from_center(50.0, 40.0, 20.0, 10.0);
    let b = BBox::from_xyxy(40.0, 35.0, 60.0, 45.0);
    assert_eq!(a, b);
  }
}
