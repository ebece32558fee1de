// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 检测流水线
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

//! 检测流水线
//!
//! 采集、预处理与推理分别在独立线程上运行，阶段之间各有一个容量为 1 的交接槽。
//! 新帧会替换尚未提交推理的旧帧，被替换的帧作为丢弃报告给下游。
//! 推理引擎由调用 [`Pipeline::run`] 的线程独占。

mod slot;
mod state;

pub use self::slot::{LatestSender, latest_slot};
pub use self::state::{FrameLifecycle, FrameState};

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Select, Sender, unbounded};
use tracing::{debug, error, info, warn};

use crate::{
  config::PipelineConfig,
  decode::Decoder,
  error::{ErrorKind, FrameError, PipelineError},
  frame::Frame,
  input::{FramePoll, FrameSource},
  mapper::{Detection, map_candidates},
  model::{InferenceEngine, ModelMetadata},
  nms::Suppressor,
  output::DetectionSink,
  preprocess::{Prepared, Preprocessor},
  tensor::Tensor,
};

/// 协作式取消标记，只在帧与帧之间检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// 各阶段耗时
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
  pub preprocess: Duration,
  pub inference: Duration,
  /// 解码、NMS 与坐标映射
  pub postprocess: Duration,
}

/// 单帧的检测结果，交给下游后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
  pub frame_id: u64,
  pub timestamp: Duration,
  /// 按置信度降序
  pub detections: Vec<Detection>,
  /// 从进入流水线到结果产生的总延迟
  pub latency: Duration,
  pub timings: StageTimings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
  pub delivered: u64,
  pub dropped: u64,
  pub failed: u64,
  pub detections: u64,
}

/// [`Pipeline::process_frame`] 的单帧结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
  Delivered { detections: usize },
  Failed(ErrorKind),
  /// 序号不大于已提交的帧，只记录日志，不报告给下游
  Rejected,
}

/// 采集线程与预处理线程报告给推理线程的事件
#[derive(Debug, Clone, PartialEq)]
enum StageEvent {
  Dropped(u64),
  Failed(u64, FrameError),
}

impl StageEvent {
  fn frame_id(&self) -> u64 {
    match self {
      StageEvent::Dropped(id) | StageEvent::Failed(id, _) => *id,
    }
  }
}

/// 槽内的帧，`displaced` 记录被它替换掉的更早帧
struct Captured {
  frame: Frame,
  lifecycle: FrameLifecycle,
  entered: Instant,
  displaced: Vec<u64>,
}

struct Staged {
  lifecycle: FrameLifecycle,
  prepared: Prepared,
  displaced: Vec<u64>,
}

/// 推理及其后的纯计算阶段，持有引擎与统计
struct InferenceStage<E> {
  engine: E,
  decoder: Decoder,
  suppressor: Suppressor,
  retry_budget: u32,
  consecutive_faults: u32,
  last_submitted: Option<u64>,
  stats: PipelineStats,
}

impl<E: InferenceEngine> InferenceStage<E> {
  fn submit<S: DetectionSink + ?Sized>(
    &mut self,
    mut lifecycle: FrameLifecycle,
    prepared: &Prepared,
    sink: &mut S,
  ) -> Result<FrameOutcome, PipelineError> {
    let frame_id = prepared.frame_id;
    if let Some(last) = self.last_submitted
      && frame_id <= last
    {
      warn!("第 {} 帧序号不大于上一帧 {}, 拒绝处理", frame_id, last);
      lifecycle.advance(FrameState::Dropped);
      return Ok(FrameOutcome::Rejected);
    }
    self.last_submitted = Some(frame_id);

    let started = Instant::now();
    let outputs = match self.engine.infer(&prepared.tensor) {
      Ok(outputs) => outputs,
      Err(err) => {
        lifecycle.advance(FrameState::Failed);
        return self.fail_inference(frame_id, err.into(), sink);
      }
    };
    let inference = started.elapsed();
    self.consecutive_faults = 0;
    lifecycle.advance(FrameState::Inferred);

    let started = Instant::now();
    let candidates = self.decoder.decode(&outputs);
    lifecycle.advance(FrameState::Decoded);
    let num_candidates = candidates.len();
    let kept = self.suppressor.suppress(candidates);
    lifecycle.advance(FrameState::Suppressed);
    let detections = map_candidates(
      &kept,
      &prepared.transform,
      prepared.frame_width,
      prepared.frame_height,
    );
    lifecycle.advance(FrameState::Mapped);
    let postprocess = started.elapsed();

    debug!(
      "第 {} 帧: 候选 {} 个, 保留 {} 个, 推理耗时 {:.2?}, 后处理耗时 {:.2?}",
      frame_id,
      num_candidates,
      detections.len(),
      inference,
      postprocess
    );

    let count = detections.len();
    let result = DetectionResult {
      frame_id,
      timestamp: prepared.timestamp,
      detections,
      latency: prepared.entered.elapsed(),
      timings: StageTimings {
        preprocess: prepared.preprocess_time,
        inference,
        postprocess,
      },
    };
    self.stats.delivered += 1;
    self.stats.detections += count as u64;
    sink.on_result(result);
    lifecycle.advance(FrameState::Delivered);
    Ok(FrameOutcome::Delivered { detections: count })
  }

  /// 连续推理失败超过预算时升级为加速器失效
  fn fail_inference<S: DetectionSink + ?Sized>(
    &mut self,
    frame_id: u64,
    err: FrameError,
    sink: &mut S,
  ) -> Result<FrameOutcome, PipelineError> {
    if let FrameError::ModelExecution(_) = err {
      self.consecutive_faults += 1;
      if self.consecutive_faults > self.retry_budget {
        let consecutive = self.consecutive_faults;
        self.record_failure(frame_id, &FrameError::AcceleratorWedged { consecutive }, sink);
        return Err(PipelineError::AcceleratorWedged {
          frame_id,
          consecutive,
        });
      }
    }
    let kind = err.kind();
    self.record_failure(frame_id, &err, sink);
    Ok(FrameOutcome::Failed(kind))
  }

  fn record_failure<S: DetectionSink + ?Sized>(
    &mut self,
    frame_id: u64,
    err: &FrameError,
    sink: &mut S,
  ) {
    match err.kind() {
      ErrorKind::ShapeMismatch | ErrorKind::AcceleratorWedged => {
        error!("第 {} 帧处理失败: {}", frame_id, err)
      }
      ErrorKind::InvalidFrame | ErrorKind::ModelExecution => {
        warn!("第 {} 帧处理失败: {}", frame_id, err)
      }
    }
    self.stats.failed += 1;
    sink.on_error(frame_id, err);
  }

  fn record_drop<S: DetectionSink + ?Sized>(&mut self, frame_id: u64, sink: &mut S) {
    debug!("第 {} 帧被丢弃", frame_id);
    self.stats.dropped += 1;
    sink.on_dropped(frame_id);
  }

  /// 先报告早于该帧的事件，再提交该帧
  fn deliver<S: DetectionSink + ?Sized>(
    &mut self,
    staged: Staged,
    events: &Receiver<StageEvent>,
    pending: &mut Vec<StageEvent>,
    recycle: &Sender<Tensor>,
    sink: &mut S,
    cancel: &CancelToken,
  ) -> Result<(), PipelineError> {
    let Staged {
      mut lifecycle,
      prepared,
      displaced,
    } = staged;
    // 早于该帧的丢弃与失败必须先于其结果到达下游
    pending.extend(events.try_iter());
    pending.extend(displaced.into_iter().map(StageEvent::Dropped));
    self.flush_events(pending, Some(prepared.frame_id), sink);

    if cancel.is_cancelled() {
      lifecycle.advance(FrameState::Dropped);
      self.record_drop(prepared.frame_id, sink);
    } else {
      self.submit(lifecycle, &prepared, sink)?;
    }
    let _ = recycle.send(prepared.tensor);
    Ok(())
  }

  /// 按帧序号报告 `before` 之前的事件；`before` 为 `None` 时报告全部
  fn flush_events<S: DetectionSink + ?Sized>(
    &mut self,
    pending: &mut Vec<StageEvent>,
    before: Option<u64>,
    sink: &mut S,
  ) {
    pending.sort_by_key(StageEvent::frame_id);
    let split = before.map_or(pending.len(), |id| {
      pending.partition_point(|event| event.frame_id() < id)
    });
    for event in pending.drain(..split) {
      match event {
        StageEvent::Dropped(id) => self.record_drop(id, sink),
        StageEvent::Failed(id, err) => self.record_failure(id, &err, sink),
      }
    }
  }
}

/// 检测流水线，独占推理引擎
pub struct Pipeline<E> {
  preprocessor: Preprocessor,
  stage: InferenceStage<E>,
  poll_interval: Duration,
}

impl<E: InferenceEngine> Pipeline<E> {
  /// 校验配置与模型元数据，并解析归一化参数
  ///
  /// 归一化参数优先取配置，其次取模型元数据；浮点输入两者都没有时返回
  /// [`ModelLoadError::MissingNormalization`](crate::ModelLoadError::MissingNormalization)。
  pub fn new(engine: E, config: &PipelineConfig) -> Result<Self, PipelineError> {
    config.validate()?;

    let metadata = engine.metadata();
    metadata.validate()?;
    let spec = metadata.input_spec()?;
    let normalization = config.normalization.or(metadata.normalization);
    let preprocessor = Preprocessor::new(spec, normalization, config.input_fill_value)?;
    let decoder = Decoder::new(
      metadata.head.clone(),
      spec.width,
      spec.height,
      config.confidence_threshold,
    )?;
    let suppressor = Suppressor::new(config.iou_threshold, config.max_detections);

    info!(
      "流水线初始化: 输入 {}x{} {:?}, 置信度阈值 {}, IoU 阈值 {}, 最大检测数 {:?}",
      spec.width,
      spec.height,
      spec.element_type,
      config.confidence_threshold,
      config.iou_threshold,
      config.max_detections
    );

    Ok(Self {
      preprocessor,
      stage: InferenceStage {
        engine,
        decoder,
        suppressor,
        retry_budget: config.execution_retry_budget,
        consecutive_faults: 0,
        last_submitted: None,
        stats: PipelineStats::default(),
      },
      poll_interval: config.poll_interval(),
    })
  }

  pub fn metadata(&self) -> &ModelMetadata {
    self.stage.engine.metadata()
  }

  pub fn stats(&self) -> PipelineStats {
    self.stage.stats
  }

  /// 在当前线程上同步处理一帧
  ///
  /// 单帧错误报告给 `sink` 后返回 `Ok`；只有加速器失效时返回 `Err`。
  pub fn process_frame<S: DetectionSink + ?Sized>(
    &mut self,
    frame: &Frame,
    sink: &mut S,
  ) -> Result<FrameOutcome, PipelineError> {
    let entered = Instant::now();
    let mut lifecycle = FrameLifecycle::new(frame.id(), FrameState::Captured);
    match self.preprocessor.prepare(frame) {
      Ok(mut prepared) => {
        prepared.entered = entered;
        lifecycle.advance(FrameState::Preprocessed);
        self.stage.submit(lifecycle, &prepared, sink)
      }
      Err(err) => {
        lifecycle.advance(FrameState::Failed);
        let kind = err.kind();
        self.stage.record_failure(frame.id(), &err, sink);
        Ok(FrameOutcome::Failed(kind))
      }
    }
  }

  /// 持续处理输入源直到其结束或被取消
  ///
  /// 返回本次运行结束时的累计统计。连续推理失败超过预算时返回
  /// [`PipelineError::AcceleratorWedged`]，此前已向 `sink` 报告该帧。
  pub fn run<Src, S>(
    &mut self,
    mut source: Src,
    sink: &mut S,
    cancel: &CancelToken,
  ) -> Result<PipelineStats, PipelineError>
  where
    Src: FrameSource + Send,
    S: DetectionSink + ?Sized,
  {
    let Pipeline {
      preprocessor,
      stage,
      poll_interval,
    } = self;
    let preprocessor = &*preprocessor;
    let poll_interval = *poll_interval;

    let (captured_tx, captured_rx) = latest_slot();
    let (staged_tx, staged_rx) = latest_slot();
    let (event_tx, event_rx) = unbounded();
    let (recycle_tx, recycle_rx) = unbounded();
    let mut pending = Vec::new();

    // 推理线程失效后让采集与预处理线程收尾
    let halt = CancelToken::new();
    let stopping = || cancel.is_cancelled() || halt.is_cancelled();

    info!("流水线开始运行");
    let outcome = thread::scope(|scope| {
      let source = &mut source;
      let stopping = &stopping;

      scope.spawn(move || capture_loop(source, captured_tx, stopping, poll_interval));
      scope.spawn(move || {
        preprocess_loop(
          preprocessor,
          captured_rx,
          staged_tx,
          event_tx,
          recycle_rx,
          stopping,
        )
      });

      let outcome = inference_loop(
        stage,
        &staged_rx,
        &event_rx,
        &mut pending,
        &recycle_tx,
        sink,
        cancel,
      );
      if outcome.is_err() {
        halt.cancel();
      }
      outcome
    });

    // 采集与预处理线程均已退出
    pending.extend(event_rx.try_iter());
    for staged in staged_rx.try_iter() {
      let Staged {
        mut lifecycle,
        prepared,
        displaced,
      } = staged;
      lifecycle.advance(FrameState::Dropped);
      pending.extend(displaced.into_iter().map(StageEvent::Dropped));
      pending.push(StageEvent::Dropped(prepared.frame_id));
    }
    stage.flush_events(&mut pending, None, sink);

    let stats = stage.stats;
    info!(
      "流水线停止: 交付 {} 帧, 丢弃 {} 帧, 失败 {} 帧, 共 {} 个检测",
      stats.delivered, stats.dropped, stats.failed, stats.detections
    );
    outcome.map(|_| stats)
  }
}

type Stopping<'a> = &'a (dyn Fn() -> bool + Sync);

fn capture_loop<Src: FrameSource + ?Sized>(
  source: &mut Src,
  output: LatestSender<Captured>,
  stopping: Stopping<'_>,
  poll_interval: Duration,
) {
  let mut last_id: Option<u64> = None;
  let mut waiting_permission = false;

  while !stopping() {
    if !source.is_permitted() {
      if !waiting_permission {
        warn!("输入源未获得访问权限, 等待授权");
        waiting_permission = true;
      }
      thread::sleep(poll_interval);
      continue;
    }
    waiting_permission = false;

    match source.poll_frame() {
      FramePoll::Ready(frame) => {
        let frame_id = frame.id();
        // 序号回退的帧不属于当前序列，只记录日志，不报告给下游
        if let Some(last) = last_id
          && frame_id <= last
        {
          warn!("第 {} 帧序号不大于上一帧 {}, 拒绝处理", frame_id, last);
          continue;
        }
        last_id = Some(frame_id);

        let captured = Captured {
          frame,
          lifecycle: FrameLifecycle::new(frame_id, FrameState::Captured),
          entered: Instant::now(),
          displaced: Vec::new(),
        };
        output.offer(captured, |newer, mut older| {
          older.lifecycle.advance(FrameState::Dropped);
          newer.displaced.append(&mut older.displaced);
          newer.displaced.push(older.frame.id());
        });
      }
      FramePoll::Pending => thread::sleep(poll_interval),
      FramePoll::Closed => {
        info!("输入源已结束");
        break;
      }
    }
  }
}

fn preprocess_loop(
  preprocessor: &Preprocessor,
  input: Receiver<Captured>,
  output: LatestSender<Staged>,
  events: Sender<StageEvent>,
  recycle: Receiver<Tensor>,
  stopping: Stopping<'_>,
) {
  let mut spare: Option<Tensor> = None;
  let mut overtaken = false;

  while let Ok(Captured {
    frame,
    mut lifecycle,
    entered,
    displaced,
  }) = input.recv()
  {
    for id in displaced {
      let _ = events.send(StageEvent::Dropped(id));
    }

    let frame_id = frame.id();
    if stopping() {
      lifecycle.advance(FrameState::Dropped);
      let _ = events.send(StageEvent::Dropped(frame_id));
      continue;
    }

    let buffer = spare.take().or_else(|| recycle.try_recv().ok());
    match preprocessor.prepare_with(&frame, buffer) {
      Ok(mut prepared) => {
        prepared.entered = entered;
        lifecycle.advance(FrameState::Preprocessed);
        // 连续两帧都被赶超时保留后一帧，输入过快也能持续出结果
        if !input.is_empty() && !overtaken {
          debug!("第 {} 帧预处理期间已有新帧到达, 丢弃", frame_id);
          lifecycle.advance(FrameState::Dropped);
          spare = Some(prepared.tensor);
          overtaken = true;
          let _ = events.send(StageEvent::Dropped(frame_id));
          continue;
        }
        overtaken = false;

        let staged = Staged {
          lifecycle,
          prepared,
          displaced: Vec::new(),
        };
        output.offer(staged, |newer, mut older| {
          older.lifecycle.advance(FrameState::Dropped);
          newer.displaced.append(&mut older.displaced);
          newer.displaced.push(older.prepared.frame_id);
          spare = Some(older.prepared.tensor);
        });
      }
      Err(err) => {
        lifecycle.advance(FrameState::Failed);
        let _ = events.send(StageEvent::Failed(frame_id, err));
      }
    }
  }
}

/// 同时等待预处理好的帧与上游事件
///
/// 上游先送出早于某事件的帧，再送出该事件。因此收到事件后取空交接槽，
/// 已收到的事件就不会再早于任何尚未交付的帧，可以立即报告。
fn inference_loop<E: InferenceEngine, S: DetectionSink + ?Sized>(
  stage: &mut InferenceStage<E>,
  staged: &Receiver<Staged>,
  events: &Receiver<StageEvent>,
  pending: &mut Vec<StageEvent>,
  recycle: &Sender<Tensor>,
  sink: &mut S,
  cancel: &CancelToken,
) -> Result<(), PipelineError> {
  let mut select = Select::new();
  let staged_index = select.recv(staged);
  let events_index = select.recv(events);

  loop {
    let operation = select.select();
    if operation.index() == staged_index {
      match operation.recv(staged) {
        Ok(item) => stage.deliver(item, events, pending, recycle, sink, cancel)?,
        Err(_) => break,
      }
    } else {
      debug_assert_eq!(operation.index(), events_index);
      match operation.recv(events) {
        Ok(event) => {
          pending.push(event);
          pending.extend(events.try_iter());
          while let Ok(item) = staged.try_recv() {
            stage.deliver(item, events, pending, recycle, sink, cancel)?;
          }
          stage.flush_events(pending, None, sink);
        }
        Err(_) => select.remove(events_index),
      }
    }
  }
  Ok(())
}
