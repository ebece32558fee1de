// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 帧输入源
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

use thiserror::Error;

use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

mod read_image_file;
pub use self::read_image_file::{FolderInput, ImageFileInput, ImageFileInputError};

/// 一次轮询的结果
#[derive(Debug)]
pub enum FramePoll {
  Ready(Frame),
  /// 暂无新帧
  Pending,
  /// 输入源已结束
  Closed,
}

/// 帧输入源（相机等），以非阻塞方式轮询
pub trait FrameSource {
  fn poll_frame(&mut self) -> FramePoll;

  /// 相机权限状态，由外部维护
  fn is_permitted(&self) -> bool {
    true
  }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn poll_frame(&mut self) -> FramePoll {
    (**self).poll_frame()
  }

  fn is_permitted(&self) -> bool {
    (**self).is_permitted()
  }
}

/// 将帧迭代器适配为输入源，迭代结束即关闭
pub struct IterSource<I> {
  inner: I,
}

impl<I: Iterator<Item = Frame>> IterSource<I> {
  pub fn new(frames: impl IntoIterator<IntoIter = I>) -> Self {
    Self {
      inner: frames.into_iter(),
    }
  }
}

impl<I: Iterator<Item = Frame>> FrameSource for IterSource<I> {
  fn poll_frame(&mut self) -> FramePoll {
    match self.inner.next() {
      Some(frame) => FramePoll::Ready(frame),
      None => FramePoll::Closed,
    }
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

pub enum InputWrapper {
  ImageFile(ImageFileInput),
  Folder(FolderInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ImageFileInput::SCHEME => Ok(InputWrapper::ImageFile(ImageFileInput::from_url(url)?)),
      FolderInput::SCHEME => Ok(InputWrapper::Folder(FolderInput::from_url(url)?)),
      _ => Err(InputError::SchemeMismatch),
    }
  }
}

impl FrameSource for InputWrapper {
  fn poll_frame(&mut self) -> FramePoll {
    match self {
      InputWrapper::ImageFile(input) => input.poll_frame(),
      InputWrapper::Folder(input) => input.poll_frame(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::PixelFormat;
  use std::time::Duration;

  #[test]
  fn iter_source_closes_after_last_frame() {
    let frames =
      (0..2).map(|id| Frame::new(id, 1, 1, PixelFormat::Gray8, Duration::ZERO, vec![0u8]));
    let mut source = IterSource::new(frames);
    assert!(matches!(source.poll_frame(), FramePoll::Ready(f) if f.id() == 0));
    assert!(matches!(source.poll_frame(), FramePoll::Ready(f) if f.id() == 1));
    assert!(matches!(source.poll_frame(), FramePoll::Closed));
    assert!(source.is_permitted());
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = url::Url::parse("v4l2:///dev/video0").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch)
    ));
  }
}
