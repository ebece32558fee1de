// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 检测结果输出
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

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::Path,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{ErrorKind, FrameError},
  mapper::Detection,
  pipeline::DetectionResult,
};

/// 下游（界面叠加层等）接收检测结果的接口
///
/// 已交付的结果按帧序号递增到达；某帧的失败或丢弃报告总是先于更新帧的结果。
pub trait DetectionSink {
  fn on_result(&mut self, result: DetectionResult);
  fn on_error(&mut self, frame_id: u64, error: &FrameError);
  fn on_dropped(&mut self, _frame_id: u64) {}
}

impl<S: DetectionSink + ?Sized> DetectionSink for &mut S {
  fn on_result(&mut self, result: DetectionResult) {
    (**self).on_result(result)
  }

  fn on_error(&mut self, frame_id: u64, error: &FrameError) {
    (**self).on_error(frame_id, error)
  }

  fn on_dropped(&mut self, frame_id: u64) {
    (**self).on_dropped(frame_id)
  }
}

fn label_of(labels: &[String], class_id: u32) -> Option<&str> {
  labels.get(class_id as usize).map(String::as_str)
}

/// 通过 tracing 输出检测结果
#[derive(Debug, Default)]
pub struct LogSink {
  labels: Vec<String>,
}

impl LogSink {
  pub fn with_labels(mut self, labels: Vec<String>) -> Self {
    self.labels = labels;
    self
  }
}

impl FromUrlWithScheme for LogSink {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogSink {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    Ok(LogSink::default())
  }
}

impl DetectionSink for LogSink {
  fn on_result(&mut self, result: DetectionResult) {
    info!(
      "帧 {} (时间: {}ms): 检测到 {} 个对象, 延迟 {:.2?}",
      result.frame_id,
      result.timestamp.as_millis(),
      result.detections.len(),
      result.latency
    );
    for det in &result.detections {
      info!(
        "  - {}: {:.2}% at ({:.0}, {:.0}, {:.0}x{:.0})",
        label_of(&self.labels, det.class_id).unwrap_or("unknown"),
        det.confidence * 100.0,
        det.bbox.x,
        det.bbox.y,
        det.bbox.width,
        det.bbox.height
      );
    }
  }

  fn on_error(&mut self, frame_id: u64, error: &FrameError) {
    warn!("帧 {} 处理失败: {}", frame_id, error);
  }

  fn on_dropped(&mut self, frame_id: u64) {
    info!("帧 {} 被丢弃", frame_id);
  }
}

#[derive(Serialize)]
struct LabeledDetection<'a> {
  #[serde(flatten)]
  detection: &'a Detection,
  #[serde(skip_serializing_if = "Option::is_none")]
  label: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Record<'a> {
  Result {
    frame_id: u64,
    timestamp_ms: f64,
    latency_ms: f64,
    preprocess_ms: f64,
    inference_ms: f64,
    postprocess_ms: f64,
    detections: Vec<LabeledDetection<'a>>,
    recorded_at: String,
  },
  Error {
    frame_id: u64,
    kind: ErrorKind,
    message: String,
    recorded_at: String,
  },
  Dropped {
    frame_id: u64,
    recorded_at: String,
  },
}

fn millis(d: std::time::Duration) -> f64 {
  d.as_secs_f64() * 1000.0
}

fn now() -> String {
  chrono::Utc::now().to_rfc3339()
}

/// 每个事件写一行 JSON
pub struct JsonLinesSink<W: Write> {
  writer: W,
  labels: Vec<String>,
}

impl JsonLinesSink<BufWriter<File>> {
  pub fn create(path: impl AsRef<Path>) -> Result<Self, OutputError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    info!("检测结果写入文件: {}", path.display());
    Ok(Self::new(BufWriter::new(File::create(path)?)))
  }
}

impl<W: Write> JsonLinesSink<W> {
  pub fn new(writer: W) -> Self {
    Self {
      writer,
      labels: Vec::new(),
    }
  }

  pub fn with_labels(mut self, labels: Vec<String>) -> Self {
    self.labels = labels;
    self
  }

  pub fn into_inner(self) -> W {
    self.writer
  }

  fn write_record(&mut self, record: &Record<'_>) {
    let written = serde_json::to_writer(&mut self.writer, record)
      .map_err(std::io::Error::from)
      .and_then(|_| self.writer.write_all(b"\n"))
      .and_then(|_| self.writer.flush());
    if let Err(e) = written {
      error!("写入检测结果失败: {}", e);
    }
  }
}

impl FromUrlWithScheme for JsonLinesSink<BufWriter<File>> {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonLinesSink<BufWriter<File>> {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    Self::create(url.path())
  }
}

impl<W: Write> DetectionSink for JsonLinesSink<W> {
  fn on_result(&mut self, result: DetectionResult) {
    let labels = std::mem::take(&mut self.labels);
    let record = Record::Result {
      frame_id: result.frame_id,
      timestamp_ms: millis(result.timestamp),
      latency_ms: millis(result.latency),
      preprocess_ms: millis(result.timings.preprocess),
      inference_ms: millis(result.timings.inference),
      postprocess_ms: millis(result.timings.postprocess),
      detections: result
        .detections
        .iter()
        .map(|detection| LabeledDetection {
          detection,
          label: label_of(&labels, detection.class_id),
        })
        .collect(),
      recorded_at: now(),
    };
    self.write_record(&record);
    drop(record);
    self.labels = labels;
  }

  fn on_error(&mut self, frame_id: u64, error: &FrameError) {
    self.write_record(&Record::Error {
      frame_id,
      kind: error.kind(),
      message: error.to_string(),
      recorded_at: now(),
    });
  }

  fn on_dropped(&mut self, frame_id: u64) {
    self.write_record(&Record::Dropped {
      frame_id,
      recorded_at: now(),
    });
  }
}

pub type JsonLinesFileSink = JsonLinesSink<BufWriter<File>>;

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper {
  JsonLines(JsonLinesFileSink),
  Log(LogSink),
}

impl OutputWrapper {
  pub fn with_labels(self, labels: Vec<String>) -> Self {
    match self {
      OutputWrapper::JsonLines(sink) => OutputWrapper::JsonLines(sink.with_labels(labels)),
      OutputWrapper::Log(sink) => OutputWrapper::Log(sink.with_labels(labels)),
    }
  }
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      JsonLinesFileSink::SCHEME => {
        Ok(OutputWrapper::JsonLines(JsonLinesFileSink::from_url(url)?))
      }
      LogSink::SCHEME => Ok(OutputWrapper::Log(LogSink::from_url(url)?)),
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl DetectionSink for OutputWrapper {
  fn on_result(&mut self, result: DetectionResult) {
    match self {
      OutputWrapper::JsonLines(sink) => sink.on_result(result),
      OutputWrapper::Log(sink) => sink.on_result(result),
    }
  }

  fn on_error(&mut self, frame_id: u64, error: &FrameError) {
    match self {
      OutputWrapper::JsonLines(sink) => sink.on_error(frame_id, error),
      OutputWrapper::Log(sink) => sink.on_error(frame_id, error),
    }
  }

  fn on_dropped(&mut self, frame_id: u64) {
    match self {
      OutputWrapper::JsonLines(sink) => sink.on_dropped(frame_id),
      OutputWrapper::Log(sink) => sink.on_dropped(frame_id),
    }
  }
}
