// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 错误类型
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
use thiserror::Error;

use crate::tensor::ElementType;

/// 推理引擎单次调用的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("输入张量形状不匹配: 期望 {expected:?} ({expected_type:?}), 实际 {actual:?} ({actual_type:?})")]
  ShapeMismatch {
    expected: Vec<usize>,
    expected_type: ElementType,
    actual: Vec<usize>,
    actual_type: ElementType,
  },
  #[error("模型执行错误: {0}")]
  Execution(String),
}

/// 单帧错误，报告给下游后继续处理下一帧
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
  #[error("无效帧: {0}")]
  InvalidFrame(String),
  #[error(transparent)]
  ShapeMismatch(InferenceError),
  #[error(transparent)]
  ModelExecution(InferenceError),
  #[error("连续 {consecutive} 帧推理失败, 加速器可能已停止响应")]
  AcceleratorWedged { consecutive: u32 },
}

impl From<InferenceError> for FrameError {
  fn from(err: InferenceError) -> Self {
    match err {
      InferenceError::ShapeMismatch { .. } => FrameError::ShapeMismatch(err),
      InferenceError::Execution(_) => FrameError::ModelExecution(err),
    }
  }
}

/// 错误类别，便于下游按类别处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  InvalidFrame,
  ShapeMismatch,
  ModelExecution,
  AcceleratorWedged,
}

impl FrameError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      FrameError::InvalidFrame(_) => ErrorKind::InvalidFrame,
      FrameError::ShapeMismatch(_) => ErrorKind::ShapeMismatch,
      FrameError::ModelExecution(_) => ErrorKind::ModelExecution,
      FrameError::AcceleratorWedged { .. } => ErrorKind::AcceleratorWedged,
    }
  }

  pub fn invalid(msg: impl Into<String>) -> Self {
    FrameError::InvalidFrame(msg.into())
  }
}

/// 模型加载错误，发生在启动阶段，不可恢复
#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型加载错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型元数据解析错误: {0}")]
  Metadata(#[from] serde_json::Error),
  #[error("模型无效: {0}")]
  Invalid(String),
  #[error("浮点输入的模型缺少归一化参数, 请在元数据或配置中指定")]
  MissingNormalization,
  #[cfg(feature = "model_rknn")]
  #[error("RKNN 错误: {0}")]
  Rknn(rknpu::Error),
}

#[cfg(feature = "model_rknn")]
impl From<rknpu::Error> for ModelLoadError {
  fn from(err: rknpu::Error) -> Self {
    ModelLoadError::Rknn(err)
  }
}

impl ModelLoadError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    ModelLoadError::Invalid(msg.into())
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("置信度阈值必须位于 [0, 1], 实际为 {0}")]
  ConfidenceThreshold(f32),
  #[error("IoU 阈值必须位于 (0, 1), 实际为 {0}")]
  IouThreshold(f32),
  #[error("最大检测数必须大于 0")]
  MaxDetections,
  #[error("归一化参数必须为有限值且 scale 非零")]
  Normalization,
}

/// 使流水线停止的致命错误
#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error(transparent)]
  ModelLoad(#[from] ModelLoadError),
  #[error("第 {frame_id} 帧时连续 {consecutive} 次推理失败, 流水线停止")]
  AcceleratorWedged { frame_id: u64, consecutive: u32 },
}
