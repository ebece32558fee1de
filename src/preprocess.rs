// 该文件是 Shanan （山南西风） 项目的一部分。
// src/preprocess.rs - Letterbox 预处理
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

use std::time::{Duration, Instant};

use image::{RgbImage, imageops::FilterType};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  error::{FrameError, ModelLoadError},
  frame::{Frame, PixelFormat},
  mapper::AffineTransform,
  tensor::{ElementType, Tensor, TensorData, TensorLayout},
};

/// 像素归一化参数: value = pixel * scale + offset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
  pub scale: f32,
  pub offset: f32,
}

impl Normalization {
  pub fn is_valid(&self) -> bool {
    self.scale.is_finite() && self.scale != 0.0 && self.offset.is_finite()
  }

  pub fn apply(&self, pixel: u8) -> f32 {
    pixel as f32 * self.scale + self.offset
  }
}

/// 模型期望的通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

impl ChannelOrder {
  fn arrange(&self, rgb: [u8; 3]) -> [u8; 3] {
    match self {
      ChannelOrder::Rgb => rgb,
      ChannelOrder::Bgr => [rgb[2], rgb[1], rgb[0]],
    }
  }
}

/// 模型输入描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
  pub width: usize,
  pub height: usize,
  pub layout: TensorLayout,
  pub element_type: ElementType,
  pub channel_order: ChannelOrder,
}

impl InputSpec {
  pub fn shape(&self) -> Vec<usize> {
    self.layout.image_shape(self.width, self.height)
  }
}

/// 预处理完成、等待推理的帧
#[derive(Debug, Clone)]
pub struct Prepared {
  pub frame_id: u64,
  pub timestamp: Duration,
  pub frame_width: u32,
  pub frame_height: u32,
  pub tensor: Tensor,
  pub transform: AffineTransform,
  /// 进入流水线的时刻，用于计算总延迟
  pub entered: Instant,
  pub preprocess_time: Duration,
}

/// 缩放后图像在模型输入中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
  x: usize,
  y: usize,
  width: usize,
  height: usize,
}

impl Placement {
  fn contains(&self, x: usize, y: usize) -> bool {
    x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
  }
}

/// 将原始帧 letterbox 到模型输入尺寸并归一化
#[derive(Debug, Clone)]
pub struct Preprocessor {
  spec: InputSpec,
  normalization: Normalization,
  fill_value: u8,
}

impl Preprocessor {
  /// 浮点输入必须提供归一化参数；定点输入直接使用原始像素
  pub fn new(
    spec: InputSpec,
    normalization: Option<Normalization>,
    fill_value: u8,
  ) -> Result<Self, ModelLoadError> {
    let normalization = match (spec.element_type, normalization) {
      (ElementType::U8, _) => Normalization {
        scale: 1.0,
        offset: 0.0,
      },
      (ElementType::F32, Some(norm)) if norm.is_valid() => norm,
      (ElementType::F32, Some(_)) => {
        return Err(ModelLoadError::invalid("归一化参数无效"));
      }
      (ElementType::F32, None) => return Err(ModelLoadError::MissingNormalization),
    };

    Ok(Self {
      spec,
      normalization,
      fill_value,
    })
  }

  pub fn spec(&self) -> &InputSpec {
    &self.spec
  }

  fn placement(&self, frame_width: u32, frame_height: u32) -> Placement {
    let (tw, th) = (self.spec.width as f64, self.spec.height as f64);
    let (fw, fh) = (frame_width as f64, frame_height as f64);
    let scale = (tw / fw).min(th / fh);

    let width = ((fw * scale).round() as usize).clamp(1, self.spec.width);
    let height = ((fh * scale).round() as usize).clamp(1, self.spec.height);

    Placement {
      x: (self.spec.width - width) / 2,
      y: (self.spec.height - height) / 2,
      width,
      height,
    }
  }

  /// 计算帧对应的仿射变换，不处理像素
  pub fn transform_for(&self, frame_width: u32, frame_height: u32) -> AffineTransform {
    let p = self.placement(frame_width, frame_height);
    AffineTransform::new(
      p.width as f32 / frame_width as f32,
      p.height as f32 / frame_height as f32,
      p.x as f32,
      p.y as f32,
    )
  }

  /// 预处理一帧，分配新的输入张量
  pub fn prepare(&self, frame: &Frame) -> Result<Prepared, FrameError> {
    self.prepare_with(frame, None)
  }

  /// 预处理一帧，优先复用 `buffer` 作为输入张量
  pub fn prepare_with(&self, frame: &Frame, buffer: Option<Tensor>) -> Result<Prepared, FrameError> {
    let entered = Instant::now();
    let mut tensor =
      buffer.unwrap_or_else(|| Tensor::zeros(self.spec.shape(), self.spec.element_type));
    let transform = self.prepare_into(frame, &mut tensor)?;
    let preprocess_time = entered.elapsed();
    debug!("第 {} 帧预处理完成，耗时: {:.2?}", frame.id(), preprocess_time);

    Ok(Prepared {
      frame_id: frame.id(),
      timestamp: frame.timestamp(),
      frame_width: frame.width(),
      frame_height: frame.height(),
      tensor,
      transform,
      entered,
      preprocess_time,
    })
  }

  /// 预处理到已有张量中；张量形状或类型不符时重新分配
  pub fn prepare_into(
    &self,
    frame: &Frame,
    tensor: &mut Tensor,
  ) -> Result<AffineTransform, FrameError> {
    let rgb = to_rgb_image(frame)?;

    let placement = self.placement(frame.width(), frame.height());
    let target = (placement.width as u32, placement.height as u32);
    let resized = if target == rgb.dimensions() {
      rgb
    } else {
      image::imageops::resize(&rgb, target.0, target.1, FilterType::Triangle)
    };

    let shape = self.spec.shape();
    if tensor.shape() != shape.as_slice() || tensor.element_type() != self.spec.element_type {
      *tensor = Tensor::zeros(shape, self.spec.element_type);
    }

    let writer = TensorWriter {
      layout: self.spec.layout,
      width: self.spec.width,
      height: self.spec.height,
      order: self.spec.channel_order,
      placement,
      resized: &resized,
    };
    let norm = self.normalization;
    match tensor.data_mut() {
      TensorData::U8(buf) => writer.write(buf, self.fill_value, |v| v),
      TensorData::F32(buf) => writer.write(buf, norm.apply(self.fill_value), |v| norm.apply(v)),
    }

    Ok(self.transform_for(frame.width(), frame.height()))
  }
}

struct TensorWriter<'a> {
  layout: TensorLayout,
  width: usize,
  height: usize,
  order: ChannelOrder,
  placement: Placement,
  resized: &'a RgbImage,
}

impl TensorWriter<'_> {
  fn write<T: Copy>(&self, buf: &mut [T], fill: T, convert: impl Fn(u8) -> T) {
    let plane = self.width * self.height;
    for y in 0..self.height {
      for x in 0..self.width {
        let pixel = self.placement.contains(x, y).then(|| {
          let px = self.resized.get_pixel(
            (x - self.placement.x) as u32,
            (y - self.placement.y) as u32,
          );
          self.order.arrange(px.0)
        });

        for c in 0..3 {
          let idx = match self.layout {
            TensorLayout::Nhwc => (y * self.width + x) * 3 + c,
            TensorLayout::Nchw => c * plane + y * self.width + x,
          };
          buf[idx] = match pixel {
            Some(px) => convert(px[c]),
            None => fill,
          };
        }
      }
    }
  }
}

fn to_rgb_image(frame: &Frame) -> Result<RgbImage, FrameError> {
  let format = frame.format();
  let bpp = format
    .bytes_per_pixel()
    .ok_or_else(|| FrameError::invalid(format!("不支持的像素格式: {:?}", format)))?;

  let (width, height) = (frame.width(), frame.height());
  if width == 0 || height == 0 {
    return Err(FrameError::invalid(format!(
      "帧尺寸为零: {}x{}",
      width, height
    )));
  }

  let expected = width as usize * height as usize * bpp;
  if frame.data().len() != expected {
    return Err(FrameError::invalid(format!(
      "帧数据长度不匹配: 期望 {}, 实际 {}",
      expected,
      frame.data().len()
    )));
  }

  let raw = if format == PixelFormat::Rgb8 {
    frame.data().to_vec()
  } else {
    frame
      .data()
      .chunks_exact(bpp)
      .flat_map(|px| format.to_rgb(px))
      .collect()
  };

  RgbImage::from_raw(width, height, raw)
    .ok_or_else(|| FrameError::invalid("无法构造 RGB 图像"))
}
