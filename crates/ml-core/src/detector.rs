use anyhow::Result;
use video_ingest::Frame;

use crate::bbox::BBox;

/// Anything that turns a frame into thresholded vehicle boxes in frame pixel coordinates.
pub trait VehicleDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BBox>>;
}

impl<D: VehicleDetector + ?Sized> VehicleDetector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BBox>> {
        (**self).detect(frame)
    }
}

#[cfg(feature = "with-tch")]
pub use torch::{TorchVehicleDetector, available_devices, parse_device};

#[cfg(feature = "with-tch")]
mod torch {
    use std::{convert::TryFrom, path::Path};

    use anyhow::{Result, bail};
    use image::imageops::FilterType;
    use tch::{self, Cuda, Device, Kind, Tensor};
    use video_ingest::{Frame, FrameFormat};

    use super::VehicleDetector;
    use crate::bbox::BBox;

    /// Upper bound on boxes kept from a single forward pass.
    const MAX_DETECTIONS: usize = 512;

    /// Device names this backend can serve: `CPU` plus `GPU`/`GPU.<n>` per CUDA device.
    pub fn available_devices() -> Vec<String> {
        let mut devices = vec!["CPU".to_string()];
        if Cuda::is_available() {
            devices.push("GPU".to_string());
            for index in 0..Cuda::device_count() {
                devices.push(format!("GPU.{index}"));
            }
        }
        devices
    }

    /// Map a configured device string onto a tch device. `MULTI:` lists use their first entry.
    pub fn parse_device(name: &str) -> Result<Device> {
        let first = name
            .strip_prefix("MULTI:")
            .and_then(|list| list.split(',').next())
            .unwrap_or(name);
        match first {
            "CPU" => Ok(Device::Cpu),
            "GPU" => Ok(Device::Cuda(0)),
            other => match other.strip_prefix("GPU.").map(str::parse::<usize>) {
                Some(Ok(index)) => Ok(Device::Cuda(index)),
                _ => bail!("device `{name}` is not supported by the TorchScript backend"),
            },
        }
    }

    /// TorchScript-backed vehicle detector.
    ///
    /// The module is expected to emit `[1, C, N]` predictions with rows of
    /// `(cx, cy, w, h, score, ...)` in detector input pixels.
    pub struct TorchVehicleDetector {
        module: tch::CModule,
        device: Device,
        input_size: (i64, i64),
        confidence_threshold: f32,
    }

    impl TorchVehicleDetector {
        pub fn new<P: AsRef<Path>>(
            model_path: P,
            device: Device,
            input_size: (i64, i64),
        ) -> Result<Self> {
            let module = tch::CModule::load_on_device(model_path, device)?;
            Ok(Self {
                module,
                device,
                input_size,
                confidence_threshold: 0.6,
            })
        }

        pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
            self.confidence_threshold = confidence;
            self
        }

        pub fn device(&self) -> Device {
            self.device
        }

        fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor> {
            if !matches!(frame.format, FrameFormat::Bgr8) {
                bail!("unsupported frame format");
            }
            let (in_w, in_h) = self.input_size;
            let resized = image::imageops::resize(
                &frame.to_rgb_image(),
                in_w as u32,
                in_h as u32,
                FilterType::Triangle,
            );
            let tensor = Tensor::from_slice(resized.as_raw())
                .to_device(self.device)
                .to_kind(Kind::Float)
                .view([1, in_h, in_w, 3])
                .permute([0, 3, 1, 2])
                / 255.0;
            Ok(tensor)
        }
    }

    impl VehicleDetector for TorchVehicleDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<BBox>> {
            let input = self.frame_to_tensor(frame)?;
            let output = self.module.forward_ts(&[input])?;
            let shape = output.size();
            if shape.len() != 3 || shape[0] != 1 {
                bail!("unexpected detector output shape: {shape:?}");
            }
            if shape[1] < 5 {
                bail!(
                    "detector output requires at least 5 channels (x,y,w,h,conf), got {}",
                    shape[1]
                );
            }

            let preds = output
                .to_device(Device::Cpu)
                .squeeze_dim(0)
                .permute([1, 0])
                .contiguous();
            let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

            let (in_w, in_h) = self.input_size;
            let x_ratio = frame.width as f32 / in_w as f32;
            let y_ratio = frame.height as f32 / in_h as f32;

            let mut boxes = Vec::new();
            for row in rows {
                if row.len() < 5 || row[4] <= self.confidence_threshold {
                    continue;
                }
                boxes.push(BBox::from_xywh([row[0], row[1], row[2], row[3]]).scale(x_ratio, y_ratio));
                if boxes.len() >= MAX_DETECTIONS {
                    break;
                }
            }
            Ok(boxes)
        }
    }
}
