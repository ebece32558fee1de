// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型元数据与推理引擎
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

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  decode::HeadFormat,
  error::{InferenceError, ModelLoadError},
  preprocess::{ChannelOrder, InputSpec, Normalization},
  tensor::{ElementType, Tensor, TensorLayout},
};

/// 模型文件附带的元数据，描述输入输出形状与检测头格式
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelMetadata {
  pub input_shape: Vec<usize>,
  #[serde(default)]
  pub input_layout: TensorLayout,
  pub input_type: ElementType,
  #[serde(default)]
  pub channel_order: ChannelOrder,
  pub outputs: Vec<Vec<usize>>,
  pub head: HeadFormat,
  #[serde(default)]
  pub normalization: Option<Normalization>,
  #[serde(default)]
  pub labels: Vec<String>,
}

impl ModelMetadata {
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
    let path = path.as_ref();
    info!("加载模型元数据: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let metadata: ModelMetadata = serde_json::from_str(&text)?;
    metadata.validate()?;
    Ok(metadata)
  }

  pub fn validate(&self) -> Result<(), ModelLoadError> {
    let spec = self.input_spec()?;
    self
      .head
      .validate_outputs(&self.outputs, spec.width, spec.height)
      .map_err(ModelLoadError::Invalid)?;

    if !self.labels.is_empty() && self.labels.len() != self.head.num_classes() {
      return Err(ModelLoadError::invalid(format!(
        "标签数量 {} 与类别数量 {} 不一致",
        self.labels.len(),
        self.head.num_classes()
      )));
    }

    if let Some(norm) = &self.normalization
      && !norm.is_valid()
    {
      return Err(ModelLoadError::invalid("元数据中的归一化参数无效"));
    }

    debug!(
      "模型输入: {:?} {:?} {:?}, 输出: {:?}",
      self.input_shape, self.input_layout, self.input_type, self.outputs
    );
    Ok(())
  }

  pub fn input_spec(&self) -> Result<InputSpec, ModelLoadError> {
    match self.input_layout.spatial(&self.input_shape) {
      Some((width, height, 3)) if self.input_shape[0] == 1 && width > 0 && height > 0 => {
        Ok(InputSpec {
          width,
          height,
          layout: self.input_layout,
          element_type: self.input_type,
          channel_order: self.channel_order,
        })
      }
      _ => Err(ModelLoadError::invalid(format!(
        "输入形状 {:?} 不是批大小为 1 的三通道 {:?} 图像",
        self.input_shape, self.input_layout
      ))),
    }
  }

  pub fn label(&self, class_id: u32) -> Option<&str> {
    self.labels.get(class_id as usize).map(String::as_str)
  }
}

/// 推理引擎，封装加速器上下文
///
/// 同一时刻只执行一次推理，由流水线独占持有。
pub trait InferenceEngine {
  fn metadata(&self) -> &ModelMetadata;

  /// 在加速器上执行一次推理，输入已通过形状检查
  fn execute(&mut self, input: &Tensor) -> Result<Vec<Tensor>, InferenceError>;

  /// 检查输入、执行推理并检查输出形状
  fn infer(&mut self, input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    check_input(self.metadata(), input)?;
    let outputs = self.execute(input)?;
    check_outputs(self.metadata(), &outputs)?;
    Ok(outputs)
  }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
  fn metadata(&self) -> &ModelMetadata {
    (**self).metadata()
  }

  fn execute(&mut self, input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    (**self).execute(input)
  }
}

pub fn check_input(metadata: &ModelMetadata, input: &Tensor) -> Result<(), InferenceError> {
  if input.shape() != metadata.input_shape.as_slice() || input.element_type() != metadata.input_type
  {
    return Err(InferenceError::ShapeMismatch {
      expected: metadata.input_shape.clone(),
      expected_type: metadata.input_type,
      actual: input.shape().to_vec(),
      actual_type: input.element_type(),
    });
  }
  Ok(())
}

pub fn check_outputs(metadata: &ModelMetadata, outputs: &[Tensor]) -> Result<(), InferenceError> {
  if outputs.len() != metadata.outputs.len() {
    return Err(InferenceError::Execution(format!(
      "预期模型输出数量为 {}, 实际为 {}",
      metadata.outputs.len(),
      outputs.len()
    )));
  }
  for (idx, (tensor, expected)) in outputs.iter().zip(&metadata.outputs).enumerate() {
    if tensor.shape() != expected.as_slice() {
      return Err(InferenceError::Execution(format!(
        "第 {} 个输出形状为 {:?}, 预期 {:?}",
        idx,
        tensor.shape(),
        expected
      )));
    }
  }
  Ok(())
}

/// 取 URL 中的 `meta` 参数作为元数据路径，缺省为模型路径换成 `.json` 扩展名
pub(crate) fn metadata_path(url: &url::Url) -> std::path::PathBuf {
  crate::query_value(url, "meta")
    .map(std::path::PathBuf::from)
    .unwrap_or_else(|| Path::new(url.path()).with_extension("json"))
}

mod replay;
pub use self::replay::{ReplayEngine, ReplayError};

#[cfg(feature = "model_rknn")]
mod rknn;
#[cfg(feature = "model_rknn")]
pub use self::rknn::{RknnEngine, RknnEngineBuilder, RknnEngineError};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error(transparent)]
  Replay(#[from] ReplayError),
  #[cfg(feature = "model_rknn")]
  #[error(transparent)]
  Rknn(#[from] RknnEngineError),
  #[error(transparent)]
  Load(#[from] ModelLoadError),
  #[error("不支持的模型 URI 方案: {0}")]
  SchemeMismatch(String),
}

/// 按 URL 方案选择推理引擎
pub enum EngineWrapper {
  Replay(ReplayEngine),
  #[cfg(feature = "model_rknn")]
  Rknn(RknnEngine),
}

impl FromUrl for EngineWrapper {
  type Error = EngineError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ReplayEngine::SCHEME => Ok(EngineWrapper::Replay(ReplayEngine::from_url(url)?)),
      #[cfg(feature = "model_rknn")]
      RknnEngineBuilder::SCHEME => Ok(EngineWrapper::Rknn(
        RknnEngineBuilder::from_url(url)?.build()?,
      )),
      scheme => Err(EngineError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl InferenceEngine for EngineWrapper {
  fn metadata(&self) -> &ModelMetadata {
    match self {
      EngineWrapper::Replay(engine) => engine.metadata(),
      #[cfg(feature = "model_rknn")]
      EngineWrapper::Rknn(engine) => engine.metadata(),
    }
  }

  fn execute(&mut self, input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    match self {
      EngineWrapper::Replay(engine) => engine.execute(input),
      #[cfg(feature = "model_rknn")]
      EngineWrapper::Rknn(engine) => engine.execute(input),
    }
  }
}
