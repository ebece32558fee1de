// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 流水线配置
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

use std::time::Duration;

use serde::Deserialize;

use crate::{error::ConfigError, preprocess::Normalization};

/// 流水线配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// 置信度阈值，低于等于该值的候选在抑制前丢弃
  pub confidence_threshold: f32,
  /// NMS IoU 阈值
  pub iou_threshold: f32,
  /// 最终输出的最大检测数
  pub max_detections: Option<usize>,
  /// Letterbox 填充值（像素值，归一化前）
  pub input_fill_value: u8,
  /// 覆盖模型元数据中的归一化参数
  pub normalization: Option<Normalization>,
  /// 连续推理失败超过该次数后视为加速器失效
  pub execution_retry_budget: u32,
  /// 输入源无新帧时的轮询间隔（毫秒）
  pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: 0.25,
      iou_threshold: 0.45,
      max_detections: Some(100),
      input_fill_value: 114,
      normalization: None,
      execution_retry_budget: 3,
      poll_interval_ms: 2,
    }
  }
}

impl PipelineConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    let conf = self.confidence_threshold;
    if !(0.0..=1.0).contains(&conf) {
      return Err(ConfigError::ConfidenceThreshold(conf));
    }

    let iou = self.iou_threshold;
    if !(iou > 0.0 && iou < 1.0) {
      return Err(ConfigError::IouThreshold(iou));
    }

    if self.max_detections == Some(0) {
      return Err(ConfigError::MaxDetections);
    }

    if let Some(norm) = &self.normalization
      && !norm.is_valid()
    {
      return Err(ConfigError::Normalization);
    }

    Ok(())
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn with_max_detections(mut self, max_detections: Option<usize>) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn with_normalization(mut self, normalization: Option<Normalization>) -> Self {
    self.normalization = normalization;
    self
  }

  pub fn with_retry_budget(mut self, budget: u32) -> Self {
    self.execution_retry_budget = budget;
    self
  }
}
