// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/replay.rs - 回放录制的模型输出
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

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{InferenceError, ModelLoadError},
  model::{InferenceEngine, ModelMetadata, check_outputs, metadata_path},
  tensor::Tensor,
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error(transparent)]
  Load(#[from] ModelLoadError),
}

#[derive(Debug, Deserialize)]
struct RecordedTensor {
  shape: Vec<usize>,
  data: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct Recording {
  outputs: Vec<RecordedTensor>,
}

/// 对每次推理都返回同一组录制输出的引擎
///
/// 用于在没有加速器的主机上离线调试解码与 NMS。
#[derive(Debug, Clone)]
pub struct ReplayEngine {
  metadata: ModelMetadata,
  outputs: Vec<Tensor>,
}

impl ReplayEngine {
  pub fn new(metadata: ModelMetadata, outputs: Vec<Tensor>) -> Result<Self, ModelLoadError> {
    metadata.validate()?;
    check_outputs(&metadata, &outputs).map_err(|e| ModelLoadError::invalid(e.to_string()))?;
    Ok(Self { metadata, outputs })
  }

  /// 从 JSON 录制文件加载: `{"outputs": [{"shape": [...], "data": [...]}]}`
  pub fn from_recording(
    metadata: ModelMetadata,
    path: impl AsRef<std::path::Path>,
  ) -> Result<Self, ModelLoadError> {
    let path = path.as_ref();
    info!("加载录制输出: {}", path.display());
    let recording: Recording = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let outputs = recording
      .outputs
      .into_iter()
      .map(|t| Tensor::from_f32(t.shape, t.data))
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| ModelLoadError::invalid(e.to_string()))?;
    Self::new(metadata, outputs)
  }
}

impl FromUrlWithScheme for ReplayEngine {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayEngine {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayError::SchemeMismatch(url.scheme().to_string()));
    }

    let metadata = ModelMetadata::from_json_file(metadata_path(url))?;
    Ok(Self::from_recording(metadata, url.path())?)
  }
}

impl InferenceEngine for ReplayEngine {
  fn metadata(&self) -> &ModelMetadata {
    &self.metadata
  }

  fn execute(&mut self, _input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    Ok(self.outputs.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{model::tests::yolov8_metadata, tensor::ElementType};

  #[test]
  fn replays_outputs_after_input_check() {
    let output = Tensor::zeros(vec![1, 6, 4], ElementType::F32);
    let mut engine = ReplayEngine::new(yolov8_metadata(), vec![output.clone()]).unwrap();

    let input = Tensor::zeros(vec![1, 64, 64, 3], ElementType::U8);
    assert_eq!(engine.infer(&input).unwrap(), vec![output]);

    let wrong = Tensor::zeros(vec![1, 32, 32, 3], ElementType::U8);
    assert!(matches!(
      engine.infer(&wrong),
      Err(InferenceError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn rejects_recording_with_wrong_shape() {
    let output = Tensor::zeros(vec![1, 6, 5], ElementType::F32);
    assert!(ReplayEngine::new(yolov8_metadata(), vec![output]).is_err());
  }

  #[test]
  fn rejects_other_schemes() {
    let url = Url::parse("rknn:///tmp/model.rknn").unwrap();
    assert!(matches!(
      ReplayEngine::from_url(&url),
      Err(ReplayError::SchemeMismatch(_))
    ));
  }
}
