// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/state.rs - 单帧状态机
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

use tracing::{error, trace};

/// 帧在流水线中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
  Captured,
  Preprocessed,
  Inferred,
  Decoded,
  Suppressed,
  Mapped,
  Delivered,
  Dropped,
  Failed,
}

impl FrameState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      FrameState::Delivered | FrameState::Dropped | FrameState::Failed
    )
  }

  /// 丢弃只能发生在提交推理之前
  pub fn can_transition_to(&self, next: FrameState) -> bool {
    use FrameState::*;
    match (*self, next) {
      (Captured, Preprocessed)
      | (Preprocessed, Inferred)
      | (Inferred, Decoded)
      | (Decoded, Suppressed)
      | (Suppressed, Mapped)
      | (Mapped, Delivered) => true,
      (Captured | Preprocessed, Dropped) => true,
      (state, Failed) => !state.is_terminal(),
      _ => false,
    }
  }
}

/// 单帧的生命周期记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLifecycle {
  frame_id: u64,
  state: FrameState,
}

impl FrameLifecycle {
  pub fn new(frame_id: u64, state: FrameState) -> Self {
    Self { frame_id, state }
  }

  pub fn frame_id(&self) -> u64 {
    self.frame_id
  }

  pub fn state(&self) -> FrameState {
    self.state
  }

  pub fn advance(&mut self, next: FrameState) {
    if !self.state.can_transition_to(next) {
      error!(
        "第 {} 帧状态转换无效: {:?} -> {:?}",
        self.frame_id, self.state, next
      );
      debug_assert!(false, "invalid frame transition {:?} -> {:?}", self.state, next);
    }
    trace!("第 {} 帧: {:?} -> {:?}", self.frame_id, self.state, next);
    self.state = next;
  }
}
