// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/slot.rs - 只保留最新元素的交接槽
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

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// 容量为 1 的交接槽的发送端，新元素替换尚未取走的旧元素
///
/// 每个槽只有一个发送端。发送端自带一个接收端用于取回旧元素，
/// 所以消费者只在发送端被丢弃、槽内元素取完之后才看到通道断开。
pub struct LatestSender<T> {
  tx: Sender<T>,
  evict: Receiver<T>,
}

/// 创建交接槽，消费端是普通的 [`Receiver`]，可以参与 `select`
pub fn latest_slot<T>() -> (LatestSender<T>, Receiver<T>) {
  let (tx, rx) = bounded(1);
  let sender = LatestSender {
    tx,
    evict: rx.clone(),
  };
  (sender, rx)
}

impl<T> LatestSender<T> {
  /// 放入元素
  ///
  /// 槽内尚未被取走的旧元素交给 `absorb` 并入新元素，旧元素的去向由调用方记录在新元素上，
  /// 消费者取到新元素时一定能看到。
  pub fn offer(&self, item: T, mut absorb: impl FnMut(&mut T, T)) {
    let mut item = item;
    loop {
      match self.tx.try_send(item) {
        Ok(()) => return,
        Err(TrySendError::Full(back)) => {
          item = back;
          // 消费者可能已先一步取走旧元素，此时直接重试
          if let Ok(old) = self.evict.try_recv() {
            absorb(&mut item, old);
          }
        }
        // 发送端持有接收端，通道不会断开
        Err(TrySendError::Disconnected(_)) => return,
      }
    }
  }
}
