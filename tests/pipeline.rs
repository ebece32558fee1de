// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 流水线集成测试
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
  cell::Cell,
  collections::VecDeque,
  rc::Rc,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use shanan_pipeline::{
  CancelToken, DetectionResult, Frame, FrameOutcome, ModelLoadError, Pipeline, PipelineConfig,
  PipelineError, PixelFormat,
  error::{ErrorKind, FrameError, InferenceError},
  input::{FramePoll, FrameSource, IterSource},
  model::{InferenceEngine, ModelMetadata},
  output::DetectionSink,
  preprocess::Normalization,
  tensor::Tensor,
};

#[derive(Debug, PartialEq)]
enum Event {
  Result(u64),
  Error(u64, ErrorKind),
  Dropped(u64),
}

#[derive(Default)]
struct Collect {
  events: Vec<Event>,
  results: Vec<DetectionResult>,
}

impl DetectionSink for Collect {
  fn on_result(&mut self, result: DetectionResult) {
    self.events.push(Event::Result(result.frame_id));
    self.results.push(result);
  }

  fn on_error(&mut self, frame_id: u64, error: &FrameError) {
    self.events.push(Event::Error(frame_id, error.kind()));
  }

  fn on_dropped(&mut self, frame_id: u64) {
    self.events.push(Event::Dropped(frame_id));
  }
}

type Script = Box<dyn Fn(usize) -> Option<InferenceError>>;

/// 按调用次数决定是否失败的引擎
struct ScriptedEngine {
  metadata: ModelMetadata,
  outputs: Vec<Tensor>,
  script: Script,
  delay: Duration,
  calls: Rc<Cell<usize>>,
}

impl ScriptedEngine {
  fn new(cells: &[([f32; 4], [f32; 2])]) -> Self {
    Self::with_metadata(metadata(cells.len(), "u8"), cells)
  }

  fn with_metadata(metadata: ModelMetadata, cells: &[([f32; 4], [f32; 2])]) -> Self {
    Self {
      metadata,
      outputs: vec![anchor_free_output(cells)],
      script: Box::new(|_| None),
      delay: Duration::ZERO,
      calls: Rc::default(),
    }
  }

  fn failing(mut self, script: impl Fn(usize) -> Option<InferenceError> + 'static) -> Self {
    self.script = Box::new(script);
    self
  }

  /// 每次推理耗时 `delay`
  fn slow(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  fn calls(&self) -> Rc<Cell<usize>> {
    Rc::clone(&self.calls)
  }
}

impl InferenceEngine for ScriptedEngine {
  fn metadata(&self) -> &ModelMetadata {
    &self.metadata
  }

  fn execute(&mut self, _input: &Tensor) -> Result<Vec<Tensor>, InferenceError> {
    let call = self.calls.get();
    self.calls.set(call + 1);
    thread::sleep(self.delay);
    match (self.script)(call) {
      Some(err) => Err(err),
      None => Ok(self.outputs.clone()),
    }
  }
}

fn metadata(anchors: usize, input_type: &str) -> ModelMetadata {
  serde_json::from_value(serde_json::json!({
    "input_shape": [1, 64, 64, 3],
    "input_type": input_type,
    "outputs": [[1, 6, anchors]],
    "head": {"type": "anchor_free", "num_classes": 2},
    "labels": ["person", "car"],
  }))
  .unwrap()
}

/// 构造 [1, 4 + 2, N] 的通道优先输出
fn anchor_free_output(cells: &[([f32; 4], [f32; 2])]) -> Tensor {
  let n = cells.len();
  let mut data = vec![0.0; 6 * n];
  for (i, (bbox, scores)) in cells.iter().enumerate() {
    for (c, v) in bbox.iter().chain(scores.iter()).enumerate() {
      data[c * n + i] = *v;
    }
  }
  Tensor::from_f32(vec![1, 6, n], data).unwrap()
}

fn frame(id: u64, width: u32, height: u32) -> Frame {
  Frame::new(
    id,
    width,
    height,
    PixelFormat::Rgb8,
    Duration::from_millis(id),
    vec![90u8; (width * height * 3) as usize],
  )
}

/// 按时间表放出帧，时间从第一次轮询开始计，放完即关闭
struct TimedSource {
  schedule: VecDeque<(Duration, Frame)>,
  started: Option<Instant>,
}

impl TimedSource {
  fn new(schedule: impl IntoIterator<Item = (u64, Frame)>) -> Self {
    Self {
      schedule: schedule
        .into_iter()
        .map(|(ms, frame)| (Duration::from_millis(ms), frame))
        .collect(),
      started: None,
    }
  }
}

impl FrameSource for TimedSource {
  fn poll_frame(&mut self) -> FramePoll {
    let started = *self.started.get_or_insert_with(Instant::now);
    let Some((due, _)) = self.schedule.front() else {
      return FramePoll::Closed;
    };
    if started.elapsed() < *due {
      return FramePoll::Pending;
    }
    self
      .schedule
      .pop_front()
      .map_or(FramePoll::Closed, |(_, frame)| FramePoll::Ready(frame))
  }
}

/// 持续送出 NV21 帧的相机，直到 `lifetime` 用完
struct Nv21Camera {
  next_id: u64,
  started: Instant,
  lifetime: Duration,
  live: Arc<AtomicBool>,
}

impl FrameSource for Nv21Camera {
  fn poll_frame(&mut self) -> FramePoll {
    if self.started.elapsed() > self.lifetime {
      self.live.store(false, Ordering::SeqCst);
      return FramePoll::Closed;
    }
    thread::sleep(Duration::from_millis(5));
    let id = self.next_id;
    self.next_id += 1;
    FramePoll::Ready(Frame::new(
      id,
      64,
      64,
      PixelFormat::Nv21,
      Duration::from_millis(id * 5),
      vec![0u8; 64 * 64 * 3 / 2],
    ))
  }
}

fn one_person() -> ScriptedEngine {
  ScriptedEngine::new(&[([32.0, 32.0, 20.0, 20.0], [0.8, 0.1])])
}

fn execution_error(_: usize) -> Option<InferenceError> {
  Some(InferenceError::Execution("npu fault".into()))
}

#[test]
fn failed_frame_is_reported_and_next_frame_processed() {
  let engine = one_person().failing(|call| {
    (call == 1).then(|| InferenceError::Execution("npu fault".into()))
  });
  let mut pipeline = Pipeline::new(engine, &PipelineConfig::default()).unwrap();
  let mut sink = Collect::default();

  for id in 6..=8 {
    pipeline.process_frame(&frame(id, 64, 64), &mut sink).unwrap();
  }

  assert_eq!(
    sink.events,
    vec![
      Event::Result(6),
      Event::Error(7, ErrorKind::ModelExecution),
      Event::Result(8),
    ]
  );
  assert_eq!(pipeline.stats().failed, 1);
}

#[test]
fn max_detections_keeps_most_confident() {
  let engine = ScriptedEngine::new(&[
    ([10.0, 10.0, 8.0, 8.0], [0.6, 0.0]),
    ([50.0, 10.0, 8.0, 8.0], [0.9, 0.0]),
    ([10.0, 50.0, 8.0, 8.0], [0.7, 0.0]),
  ]);
  let config = PipelineConfig::default()
    .with_confidence_threshold(0.5)
    .with_max_detections(Some(1));
  let mut pipeline = Pipeline::new(engine, &config).unwrap();
  let mut sink = Collect::default();

  let outcome = pipeline.process_frame(&frame(1, 64, 64), &mut sink).unwrap();
  assert_eq!(outcome, FrameOutcome::Delivered { detections: 1 });
  assert_eq!(sink.results[0].detections[0].confidence, 0.9);
}

#[test]
fn letterboxed_detection_maps_to_original_frame() {
  let mut pipeline = Pipeline::new(one_person(), &PipelineConfig::default()).unwrap();
  let mut sink = Collect::default();

  pipeline.process_frame(&frame(1, 128, 64), &mut sink).unwrap();

  let bbox = sink.results[0].detections[0].bbox;
  assert!((bbox.x - 44.0).abs() < 1e-3);
  assert!((bbox.y - 12.0).abs() < 1e-3);
  assert!((bbox.width - 40.0).abs() < 1e-3);
  assert!((bbox.height - 40.0).abs() < 1e-3);
}

#[test]
fn identical_inputs_give_identical_detections() {
  let cells = [
    ([20.0, 20.0, 16.0, 16.0], [0.7, 0.3]),
    ([22.0, 21.0, 16.0, 16.0], [0.65, 0.0]),
    ([45.0, 40.0, 10.0, 12.0], [0.0, 0.55]),
  ];
  let run = || {
    let engine = ScriptedEngine::new(&cells);
    let mut pipeline = Pipeline::new(engine, &PipelineConfig::default()).unwrap();
    let mut sink = Collect::default();
    pipeline.process_frame(&frame(3, 96, 80), &mut sink).unwrap();
    sink.results.remove(0).detections
  };
  assert_eq!(run(), run());
}

#[test]
fn consecutive_execution_errors_escalate() {
  let engine = one_person().failing(execution_error);
  let config = PipelineConfig::default().with_retry_budget(2);
  let mut pipeline = Pipeline::new(engine, &config).unwrap();
  let mut sink = Collect::default();

  for id in 1..=2 {
    let outcome = pipeline.process_frame(&frame(id, 64, 64), &mut sink).unwrap();
    assert_eq!(outcome, FrameOutcome::Failed(ErrorKind::ModelExecution));
  }
  let err = pipeline.process_frame(&frame(3, 64, 64), &mut sink).unwrap_err();
  assert!(matches!(
    err,
    PipelineError::AcceleratorWedged {
      frame_id: 3,
      consecutive: 3
    }
  ));
  assert_eq!(sink.events.last(), Some(&Event::Error(3, ErrorKind::AcceleratorWedged)));
}

#[test]
fn success_resets_retry_budget() {
  let engine = one_person().failing(|call| {
    (call % 2 == 0).then(|| InferenceError::Execution("npu fault".into()))
  });
  let config = PipelineConfig::default().with_retry_budget(1);
  let mut pipeline = Pipeline::new(engine, &config).unwrap();
  let mut sink = Collect::default();

  for id in 0..6 {
    pipeline.process_frame(&frame(id, 64, 64), &mut sink).unwrap();
  }
  assert_eq!(pipeline.stats().delivered, 3);
  assert_eq!(pipeline.stats().failed, 3);
}

#[test]
fn shape_mismatch_does_not_count_towards_budget() {
  let engine = one_person().failing(|_| {
    Some(InferenceError::ShapeMismatch {
      expected: vec![1, 64, 64, 3],
      expected_type: shanan_pipeline::tensor::ElementType::U8,
      actual: vec![1, 32, 32, 3],
      actual_type: shanan_pipeline::tensor::ElementType::U8,
    })
  });
  let config = PipelineConfig::default().with_retry_budget(0);
  let mut pipeline = Pipeline::new(engine, &config).unwrap();
  let mut sink = Collect::default();

  for id in 0..3 {
    let outcome = pipeline.process_frame(&frame(id, 64, 64), &mut sink).unwrap();
    assert_eq!(outcome, FrameOutcome::Failed(ErrorKind::ShapeMismatch));
  }
}

#[test]
fn invalid_frame_is_reported() {
  let mut pipeline = Pipeline::new(one_person(), &PipelineConfig::default()).unwrap();
  let mut sink = Collect::default();

  let empty = Frame::new(1, 0, 64, PixelFormat::Rgb8, Duration::ZERO, Vec::<u8>::new());
  pipeline.process_frame(&empty, &mut sink).unwrap();
  let short = Frame::new(2, 4, 4, PixelFormat::Rgb8, Duration::ZERO, vec![0u8; 10]);
  pipeline.process_frame(&short, &mut sink).unwrap();

  assert_eq!(
    sink.events,
    vec![
      Event::Error(1, ErrorKind::InvalidFrame),
      Event::Error(2, ErrorKind::InvalidFrame),
    ]
  );
}

#[test]
fn float_model_requires_normalization() {
  let cells = [([32.0, 32.0, 20.0, 20.0], [0.8, 0.1])];
  let engine = ScriptedEngine::with_metadata(metadata(1, "f32"), &cells);
  assert!(matches!(
    Pipeline::new(engine, &PipelineConfig::default()),
    Err(PipelineError::ModelLoad(ModelLoadError::MissingNormalization))
  ));

  let engine = ScriptedEngine::with_metadata(metadata(1, "f32"), &cells);
  let config = PipelineConfig::default().with_normalization(Some(Normalization {
    scale: 1.0 / 255.0,
    offset: 0.0,
  }));
  let mut pipeline = Pipeline::new(engine, &config).unwrap();
  let mut sink = Collect::default();
  let outcome = pipeline.process_frame(&frame(1, 64, 64), &mut sink).unwrap();
  assert_eq!(outcome, FrameOutcome::Delivered { detections: 1 });
}

#[test]
fn run_delivers_in_order_and_accounts_for_every_frame() {
  let mut pipeline = Pipeline::new(one_person(), &PipelineConfig::default()).unwrap();
  let mut sink = Collect::default();
  let frames = (1..=50).map(|id| frame(id, 96, 72));

  let stats = pipeline
    .run(IterSource::new(frames), &mut sink, &CancelToken::new())
    .unwrap();

  let mut seen: Vec<u64> = sink
    .events
    .iter()
    .map(|event| match event {
      Event::Result(id) | Event::Dropped(id) | Event::Error(id, _) => *id,
    })
    .collect();
  let delivered: Vec<u64> = sink.results.iter().map(|r| r.frame_id).collect();
  assert!(delivered.windows(2).all(|w| w[0] < w[1]));
  assert_eq!(delivered.last(), Some(&50));
  // 每帧恰好报告一次，且报告按帧序号排列
  assert!(seen.windows(2).all(|w| w[0] < w[1]));
  seen.dedup();
  assert_eq!(seen, (1..=50).collect::<Vec<_>>());
  assert_eq!(stats.delivered + stats.dropped, 50);
}

#[test]
fn run_stops_when_accelerator_is_wedged() {
  let engine = one_person().failing(execution_error);
  let config = PipelineConfig::default().with_retry_budget(0);
  let mut pipeline = Pipeline::new(engine, &config).unwrap();
  let mut sink = Collect::default();
  let frames = (1..=20).map(|id| frame(id, 64, 64));

  let err = pipeline
    .run(IterSource::new(frames), &mut sink, &CancelToken::new())
    .unwrap_err();

  let PipelineError::AcceleratorWedged { frame_id, .. } = &err else {
    panic!("unexpected error: {err}");
  };
  assert!(sink.events.contains(&Event::Error(*frame_id, ErrorKind::AcceleratorWedged)));
  assert!(sink.results.is_empty());
}

#[test]
fn frame_overtaken_during_preprocessing_never_reaches_engine() {
  let engine = one_person();
  let calls = engine.calls();
  let mut pipeline = Pipeline::new(engine, &PipelineConfig::default()).unwrap();
  let mut sink = Collect::default();
  // 帧 10 很大，帧 11 在它预处理完成之前到达
  let source = TimedSource::new([(0, frame(10, 4000, 3000)), (5, frame(11, 64, 64))]);

  let stats = pipeline.run(source, &mut sink, &CancelToken::new()).unwrap();

  assert_eq!(sink.events, vec![Event::Dropped(10), Event::Result(11)]);
  assert_eq!(calls.get(), 1);
  assert_eq!((stats.delivered, stats.dropped), (1, 1));
}

#[test]
fn frame_waiting_for_busy_engine_is_replaced_by_newer_one() {
  let engine = one_person().slow(Duration::from_millis(300));
  let calls = engine.calls();
  let mut pipeline = Pipeline::new(engine, &PipelineConfig::default()).unwrap();
  let mut sink = Collect::default();
  // 帧 1 推理期间，帧 2 预处理完成后在交接槽中等待，随后被帧 3 替换
  let source = TimedSource::new([
    (0, frame(1, 64, 64)),
    (80, frame(2, 64, 64)),
    (160, frame(3, 64, 64)),
  ]);

  pipeline.run(source, &mut sink, &CancelToken::new()).unwrap();

  assert_eq!(
    sink.events,
    vec![Event::Result(1), Event::Dropped(2), Event::Result(3)]
  );
  assert_eq!(calls.get(), 2);
}

/// 第一次收到错误时记录输入源是否仍在送帧，然后取消运行
struct StopOnError {
  live: Arc<AtomicBool>,
  cancel: CancelToken,
  first_error_while_live: Option<bool>,
  errors: usize,
}

impl DetectionSink for StopOnError {
  fn on_result(&mut self, _result: DetectionResult) {}

  fn on_error(&mut self, _frame_id: u64, error: &FrameError) {
    assert_eq!(error.kind(), ErrorKind::InvalidFrame);
    self.errors += 1;
    if self.first_error_while_live.is_none() {
      self.first_error_while_live = Some(self.live.load(Ordering::SeqCst));
      self.cancel.cancel();
    }
  }
}

#[test]
fn failures_reach_sink_while_source_is_still_live() {
  let live = Arc::new(AtomicBool::new(true));
  let cancel = CancelToken::new();
  let camera = Nv21Camera {
    next_id: 1,
    started: Instant::now(),
    lifetime: Duration::from_secs(5),
    live: Arc::clone(&live),
  };
  let mut sink = StopOnError {
    live,
    cancel: cancel.clone(),
    first_error_while_live: None,
    errors: 0,
  };
  let mut pipeline = Pipeline::new(one_person(), &PipelineConfig::default()).unwrap();

  let started = Instant::now();
  let stats = pipeline.run(camera, &mut sink, &cancel).unwrap();

  assert_eq!(sink.first_error_while_live, Some(true));
  assert!(started.elapsed() < Duration::from_secs(5));
  assert_eq!(stats.failed as usize, sink.errors);
  assert_eq!(stats.delivered, 0);
}
