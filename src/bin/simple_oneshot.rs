// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/simple_oneshot.rs - 单帧推理
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use shanan_pipeline::{
  FromUrl, Pipeline, PipelineConfig,
  input::InputWrapper,
  model::EngineWrapper,
  output::OutputWrapper,
  task::{OneShotTask, Task},
};
use tracing::info;

/// Shanan 检测流水线参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型 URI，例如 rknn:///path/model.rknn 或 replay:///path/recording.json
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 流水线配置文件 (JSON)
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<std::path::PathBuf>,
  #[arg(long, value_name = "CONFIDENCE")]
  pub confidence: Option<f32>,
  #[arg(long, value_name = "IOU")]
  pub iou: Option<f32>,
  #[arg(long, value_name = "MAX_DETECTIONS")]
  pub max_detections: Option<usize>,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
  let mut config = match &args.config {
    Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
    None => PipelineConfig::default(),
  };
  if let Some(confidence) = args.confidence {
    config = config.with_confidence_threshold(confidence);
  }
  if let Some(iou) = args.iou {
    config = config.with_iou_threshold(iou);
  }
  if args.max_detections.is_some() {
    config = config.with_max_detections(args.max_detections);
  }
  Ok(config)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = load_config(&args)?;
  let input = InputWrapper::from_url(&args.input)?;
  let engine = EngineWrapper::from_url(&args.model)?;
  let pipeline = Pipeline::new(engine, &config)?;
  let output =
    OutputWrapper::from_url(&args.output)?.with_labels(pipeline.metadata().labels.clone());

  OneShotTask.run_task(input, pipeline, output)?;

  Ok(())
}
