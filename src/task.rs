// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 任务驱动
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
  thread,
  time::{Duration, Instant},
};
use tracing::{info, warn};

use crate::{
  frame::Frame,
  input::{FramePoll, FrameSource},
  model::InferenceEngine,
  output::DetectionSink,
  pipeline::{CancelToken, FrameOutcome, Pipeline},
};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

pub trait Task<I, E, O>: Sized {
  type Error;
  fn run_task(self, input: I, pipeline: Pipeline<E>, output: O) -> Result<(), Self::Error>;
}

/// 阻塞等待输入源的下一帧
fn next_frame<I: FrameSource>(input: &mut I) -> anyhow::Result<Frame> {
  loop {
    if !input.is_permitted() {
      thread::sleep(POLL_INTERVAL);
      continue;
    }
    match input.poll_frame() {
      FramePoll::Ready(frame) => return Ok(frame),
      FramePoll::Pending => thread::sleep(POLL_INTERVAL),
      FramePoll::Closed => anyhow::bail!("没有输入帧"),
    }
  }
}

pub struct OneShotTask;

impl<I: FrameSource, E: InferenceEngine, O: DetectionSink> Task<I, E, O> for OneShotTask {
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: I,
    mut pipeline: Pipeline<E>,
    mut output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = next_frame(&mut input)?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let outcome = pipeline.process_frame(&frame, &mut output)?;
    info!("推理完成，耗时: {:.2?}, 结果: {:?}", now.elapsed(), outcome);

    Ok(())
  }
}

/// 对同一帧重复推理，统计平均耗时
#[derive(Debug)]
pub struct RepeatShotTask {
  repeat_times: usize,
  warmup: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self {
      repeat_times: 1000,
      warmup: 2,
    }
  }
}

impl RepeatShotTask {
  pub fn with_repeat_times(mut self, repeat_times: usize) -> Self {
    self.repeat_times = repeat_times;
    self
  }

  /// 前 `warmup` 次不计入平均耗时
  pub fn with_warmup(mut self, warmup: usize) -> Self {
    self.warmup = warmup;
    self
  }
}

impl<I: FrameSource, E: InferenceEngine, O: DetectionSink> Task<I, E, O> for RepeatShotTask {
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: I,
    mut pipeline: Pipeline<E>,
    mut output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = next_frame(&mut input)?;
    info!("输入帧获取成功，开始推理...");

    let mut times = Vec::with_capacity(self.repeat_times);
    for i in 0..self.repeat_times {
      // 每次推理都需要递增的帧序号
      let repeated = Frame::new(
        frame.id() + i as u64,
        frame.width(),
        frame.height(),
        frame.format(),
        frame.timestamp(),
        frame.data(),
      );
      let now = Instant::now();
      let outcome = pipeline.process_frame(&repeated, &mut output)?;
      let elapsed = now.elapsed();
      info!("({})推理完成，耗时: {:.2?}", i, elapsed);
      if let FrameOutcome::Failed(kind) = outcome {
        warn!("({})推理失败: {:?}", i, kind);
        continue;
      }
      times.push(elapsed);
    }

    match mean_after_warmup(&times, self.warmup) {
      Some(mean) => warn!("平均推理时间: {:.2?}", mean),
      None => warn!("有效推理次数不足 {}, 无法统计平均时间", self.warmup + 1),
    }

    Ok(())
  }
}

fn mean_after_warmup(times: &[Duration], warmup: usize) -> Option<Duration> {
  let measured = times.get(warmup..).filter(|t| !t.is_empty())?;
  Some(measured.iter().sum::<Duration>() / measured.len() as u32)
}

/// 只输出前 `limit` 帧的输入源
struct Limited<I> {
  inner: I,
  remaining: Option<usize>,
}

impl<I: FrameSource> FrameSource for Limited<I> {
  fn poll_frame(&mut self) -> FramePoll {
    match self.remaining {
      Some(0) => FramePoll::Closed,
      Some(ref mut n) => {
        let poll = self.inner.poll_frame();
        if let FramePoll::Ready(_) = poll {
          *n -= 1;
        }
        poll
      }
      None => self.inner.poll_frame(),
    }
  }

  fn is_permitted(&self) -> bool {
    self.inner.is_permitted()
  }
}

/// 持续处理输入源，Ctrl-C 时停止
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<I: FrameSource + Send, E: InferenceEngine, O: DetectionSink> Task<I, E, O>
  for ContinuousTask
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: I,
    mut pipeline: Pipeline<E>,
    mut output: O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    let cancel = CancelToken::new();

    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      handler_token.cancel();
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })?;

    if let Some(n) = self.frame_number {
      info!("最多处理 {} 帧", n);
    }
    let input = Limited {
      inner: input,
      remaining: self.frame_number,
    };
    let stats = pipeline.run(input, &mut output, &cancel)?;

    info!("任务完成，退出: {:?}", stats);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{frame::PixelFormat, input::IterSource};

  fn frame(id: u64) -> Frame {
    Frame::new(id, 2, 2, PixelFormat::Gray8, Duration::ZERO, vec![0u8; 4])
  }

  #[test]
  fn limited_source_closes_after_limit() {
    let mut source = Limited {
      inner: IterSource::new((0..5).map(frame)),
      remaining: Some(2),
    };
    assert!(matches!(source.poll_frame(), FramePoll::Ready(f) if f.id() == 0));
    assert!(matches!(source.poll_frame(), FramePoll::Ready(f) if f.id() == 1));
    assert!(matches!(source.poll_frame(), FramePoll::Closed));
  }

  #[test]
  fn mean_skips_warmup() {
    let times = [100, 100, 4, 6].map(Duration::from_millis);
    assert_eq!(mean_after_warmup(&times, 2), Some(Duration::from_millis(5)));
    assert_eq!(mean_after_warmup(&times[..2], 2), None);
  }

  #[test]
  fn next_frame_fails_on_closed_source() {
    let mut source = IterSource::new(Vec::<Frame>::new());
    assert!(next_frame(&mut source).is_err());
  }
}
