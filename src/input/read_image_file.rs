// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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
  collections::VecDeque,
  path::{Path, PathBuf},
  time::Instant,
};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{FramePoll, FrameSource},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("No image found in {0}")]
  EmptyFolder(String),
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn load_rgb(path: &Path) -> Result<RgbImage, ImageFileInputError> {
  Ok(ImageReader::open(path)?.decode()?.to_rgb8())
}

fn check_scheme(url: &Url, scheme: &str) -> Result<(), ImageFileInputError> {
  if url.scheme() != scheme {
    error!(
      "URI scheme mismatch: expected '{}', found '{}'",
      scheme,
      url.scheme()
    );
    return Err(ImageFileInputError::SchemaMismatch);
  }
  Ok(())
}

/// 单张图像输入，产生一帧后关闭
pub struct ImageFileInput {
  image: Option<RgbImage>,
  start: Instant,
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    Ok(Self {
      image: Some(load_rgb(path.as_ref())?),
      start: Instant::now(),
    })
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;
    Self::open(url.path())
  }
}

impl FrameSource for ImageFileInput {
  fn poll_frame(&mut self) -> FramePoll {
    match self.image.take() {
      Some(image) => FramePoll::Ready(Frame::from_rgb_image(0, self.start.elapsed(), image)),
      None => FramePoll::Closed,
    }
  }
}

/// 按文件名顺序读取目录下的图像，每张作为一帧
pub struct FolderInput {
  paths: VecDeque<PathBuf>,
  next_id: u64,
  start: Instant,
}

impl FolderInput {
  pub fn open(directory: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    let directory = directory.as_ref();
    let mut paths = std::fs::read_dir(directory)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| {
        path
          .extension()
          .and_then(|ext| ext.to_str())
          .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
      })
      .collect::<Vec<_>>();
    paths.sort();

    if paths.is_empty() {
      return Err(ImageFileInputError::EmptyFolder(
        directory.display().to_string(),
      ));
    }
    info!("目录 {} 中共有 {} 张图像", directory.display(), paths.len());

    Ok(Self {
      paths: paths.into(),
      next_id: 0,
      start: Instant::now(),
    })
  }
}

impl FromUrlWithScheme for FolderInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for FolderInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;
    Self::open(url.path())
  }
}

impl FrameSource for FolderInput {
  fn poll_frame(&mut self) -> FramePoll {
    while let Some(path) = self.paths.pop_front() {
      match load_rgb(&path) {
        Ok(image) => {
          let id = self.next_id;
          self.next_id += 1;
          return FramePoll::Ready(Frame::from_rgb_image(id, self.start.elapsed(), image));
        }
        Err(e) => warn!("跳过无法读取的图像 {}: {}", path.display(), e),
      }
    }
    FramePoll::Closed
  }
}
