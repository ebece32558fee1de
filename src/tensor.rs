// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 张量定义
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

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
  /// 定点（量化）输入，直接使用原始像素字节
  U8,
  F32,
}

/// 图像张量的内存排布
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
  #[default]
  Nhwc,
  Nchw,
}

impl TensorLayout {
  /// 构造批大小为 1 的三通道图像张量形状
  pub fn image_shape(&self, width: usize, height: usize) -> Vec<usize> {
    match self {
      TensorLayout::Nhwc => vec![1, height, width, 3],
      TensorLayout::Nchw => vec![1, 3, height, width],
    }
  }

  /// 从四维形状中取出 (宽, 高, 通道)
  pub fn spatial(&self, shape: &[usize]) -> Option<(usize, usize, usize)> {
    match (self, shape) {
      (TensorLayout::Nhwc, &[_, h, w, c]) => Some((w, h, c)),
      (TensorLayout::Nchw, &[_, c, h, w]) => Some((w, h, c)),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  U8(Vec<u8>),
  F32(Vec<f32>),
}

impl TensorData {
  pub fn len(&self) -> usize {
    match self {
      TensorData::U8(v) => v.len(),
      TensorData::F32(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 稠密张量
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  shape: Vec<usize>,
  data: TensorData,
}

/// 形状与数据长度不一致
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("张量形状 {shape:?} 需要 {expected} 个元素, 实际 {actual} 个")]
pub struct TensorSizeError {
  pub shape: Vec<usize>,
  pub expected: usize,
  pub actual: usize,
}

impl Tensor {
  pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self, TensorSizeError> {
    let expected = shape.iter().product::<usize>();
    if expected != data.len() {
      return Err(TensorSizeError {
        shape,
        expected,
        actual: data.len(),
      });
    }
    Ok(Self { shape, data })
  }

  pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorSizeError> {
    Self::new(shape, TensorData::F32(data))
  }

  /// 以零填充的张量
  pub fn zeros(shape: Vec<usize>, element_type: ElementType) -> Self {
    let len = shape.iter().product::<usize>();
    let data = match element_type {
      ElementType::U8 => TensorData::U8(vec![0; len]),
      ElementType::F32 => TensorData::F32(vec![0.0; len]),
    };
    Self { shape, data }
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn element_type(&self) -> ElementType {
    match self.data {
      TensorData::U8(_) => ElementType::U8,
      TensorData::F32(_) => ElementType::F32,
    }
  }

  pub fn data(&self) -> &TensorData {
    &self.data
  }

  pub(crate) fn data_mut(&mut self) -> &mut TensorData {
    &mut self.data
  }

  pub fn as_f32(&self) -> Option<&[f32]> {
    match &self.data {
      TensorData::F32(v) => Some(v),
      TensorData::U8(_) => None,
    }
  }

  pub fn as_u8(&self) -> Option<&[u8]> {
    match &self.data {
      TensorData::U8(v) => Some(v),
      TensorData::F32(_) => None,
    }
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}
