// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 原始帧定义
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

use std::time::Duration;

/// 原始像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
  Rgb8,
  Bgr8,
  Rgba8,
  Bgra8,
  Gray8,
  /// Android 相机常见的半平面 YUV，目前不支持
  Nv21,
  /// 平面 YUV 4:2:0，目前不支持
  Yuv420,
}

impl PixelFormat {
  /// 每像素字节数，不支持的格式返回 `None`
  pub fn bytes_per_pixel(&self) -> Option<usize> {
    match self {
      PixelFormat::Rgb8 | PixelFormat::Bgr8 => Some(3),
      PixelFormat::Rgba8 | PixelFormat::Bgra8 => Some(4),
      PixelFormat::Gray8 => Some(1),
      PixelFormat::Nv21 | PixelFormat::Yuv420 => None,
    }
  }

  pub fn is_supported(&self) -> bool {
    self.bytes_per_pixel().is_some()
  }

  /// 读取 `pixel` 处的 RGB 值，`pixel` 的长度必须等于 `bytes_per_pixel`
  pub(crate) fn to_rgb(&self, pixel: &[u8]) -> [u8; 3] {
    match self {
      PixelFormat::Rgb8 | PixelFormat::Rgba8 => [pixel[0], pixel[1], pixel[2]],
      PixelFormat::Bgr8 | PixelFormat::Bgra8 => [pixel[2], pixel[1], pixel[0]],
      PixelFormat::Gray8 => [pixel[0]; 3],
      PixelFormat::Nv21 | PixelFormat::Yuv420 => [0; 3],
    }
  }
}

/// 相机采集的一帧图像
///
/// 采集后不可变，由输入源交给预处理器后即转移所有权。
#[derive(Debug, Clone)]
pub struct Frame {
  id: u64,
  width: u32,
  height: u32,
  format: PixelFormat,
  timestamp: Duration,
  data: Box<[u8]>,
}

impl Frame {
  pub fn new(
    id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    timestamp: Duration,
    data: impl Into<Box<[u8]>>,
  ) -> Self {
    Self {
      id,
      width,
      height,
      format,
      timestamp,
      data: data.into(),
    }
  }

  /// 帧序号，单调递增
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  /// 采集时间戳，相对于输入源启动时刻
  pub fn timestamp(&self) -> Duration {
    self.timestamp
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }
}

impl Frame {
  /// 由 RGB 图像构造帧
  pub fn from_rgb_image(id: u64, timestamp: Duration, image: image::RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Frame::new(
      id,
      width,
      height,
      PixelFormat::Rgb8,
      timestamp,
      image.into_raw(),
    )
  }
}
