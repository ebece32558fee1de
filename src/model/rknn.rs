// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/rknn.rs - RKNN NPU 推理引擎
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

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{InferenceError, ModelLoadError},
  model::{InferenceEngine, ModelMetadata, metadata_path},
  tensor::{ElementType, Tensor, TensorLayout},
};

const RKNN_NUM_INPUTS: u32 = 1;

#[derive(Error, Debug)]
pub enum RknnEngineError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error(transparent)]
  Load(#[from] ModelLoadError),
}

/// Rockchip NPU 上的推理引擎
pub struct RknnEngine {
  context: Context,
  metadata: ModelMetadata,
}

pub struct RknnEngineBuilder {
  model_path: String,
  metadata: ModelMetadata,
  flags: InitFlags,
}

impl FromUrlWithScheme for RknnEngineBuilder {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for RknnEngineBuilder {
  type Error = RknnEngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RknnEngineError::SchemeMismatch(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let metadata = ModelMetadata::from_json_file(metadata_path(url))?;
    Ok(RknnEngineBuilder {
      model_path: url.path().to_string(),
      metadata,
      flags: InitFlags::default(),
    })
  }
}

impl RknnEngineBuilder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn build(self) -> Result<RknnEngine, ModelLoadError> {
    if self.metadata.input_type != ElementType::U8 {
      return Err(ModelLoadError::invalid("RKNN 模型输入必须为 u8"));
    }

    info!("加载模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, self.flags)?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(ModelLoadError::invalid(format!("无法查询 SDK 版本: {}", e)));
      }
    }

    let num_inputs = context.num_inputs()?;
    let num_outputs = context.num_outputs()?;
    if num_inputs != RKNN_NUM_INPUTS {
      return Err(ModelLoadError::invalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNN_NUM_INPUTS, num_inputs
      )));
    }
    if num_outputs as usize != self.metadata.outputs.len() {
      return Err(ModelLoadError::invalid(format!(
        "元数据声明 {} 个输出, 模型实际为 {}",
        self.metadata.outputs.len(),
        num_outputs
      )));
    }

    info!("模型加载完成");
    Ok(RknnEngine {
      context,
      metadata: self.metadata,
    })
  }
}

impl InferenceEngine for RknnEngine {
  fn metadata(&self) -> &ModelMetadata {
    &self.metadata
  }

  fn execute(&mut self, input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    let data = input
      .as_u8()
      .ok_or_else(|| InferenceError::Execution("RKNN 输入必须为 u8 张量".to_string()))?;
    let format = match self.metadata.input_layout {
      TensorLayout::Nhwc => TensorFormat::NHWC,
      TensorLayout::Nchw => TensorFormat::NCHW,
    };

    debug!("设置模型输入");
    self
      .context
      .set_input(0, data, format, TensorType::UInt8)
      .map_err(|e| InferenceError::Execution(format!("设置输入失败: {}", e)))?;

    debug!("执行模型推理");
    self
      .context
      .run()
      .map_err(|e| InferenceError::Execution(format!("推理失败: {}", e)))?;

    debug!("获取模型输出");
    let output = self
      .context
      .get_outputs()
      .map_err(|e| InferenceError::Execution(format!("获取输出失败: {}", e)))?;

    self
      .metadata
      .outputs
      .iter()
      .enumerate()
      .map(|(idx, shape)| {
        let data = output
          .get_f32(idx)
          .map_err(|e| InferenceError::Execution(format!("获取第 {} 个输出失败: {}", idx, e)))?;
        Tensor::from_f32(shape.clone(), data.to_vec())
          .map_err(|e| InferenceError::Execution(e.to_string()))
      })
      .collect()
  }
}
