//! 坐标模型：像素 / 归一化 / 0–1000 定点三种坐标及其互转
//!
//! 像素 = round(归一化 × 尺寸)，并夹到 [0, 尺寸)；定点 = round(归一化 × 1000)。
//! 转换有损但误差有界：归一化 → 定点 → 归一化 的绝对误差不超过 1/1000。

use serde::{Deserialize, Serialize};

/// 定点坐标的量程
pub const FIXED_SCALE: u16 = 1000;

/// 设备屏幕尺寸（像素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSize {
    pub width: u32,
    pub height: u32,
}

impl DeviceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// 宽高互换（横屏时使用）
    pub fn swapped(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

/// 屏幕旋转方向（对应 Android surface orientation 0..=3）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl Orientation {
    pub fn from_index(index: u8) -> Self {
        match index % 4 {
            1 => Orientation::Rotation90,
            2 => Orientation::Rotation180,
            3 => Orientation::Rotation270,
            _ => Orientation::Rotation0,
        }
    }

    /// 90° / 270°
    pub fn is_landscape(&self) -> bool {
        matches!(self, Orientation::Rotation90 | Orientation::Rotation270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

impl PixelPoint {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// 夹到 [0, 尺寸)
    pub fn clamped(self, size: DeviceSize) -> Self {
        Self {
            x: clamp_axis(self.x as f64, size.width),
            y: clamp_axis(self.y as f64, size.height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub x: f64,
    pub y: f64,
}

impl NormalizedPoint {
    /// 超出 [0,1] 的分量会被夹回
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: unit(x),
            y: unit(y),
        }
    }

    pub fn to_pixel(self, size: DeviceSize) -> PixelPoint {
        PixelPoint {
            x: clamp_axis((self.x * size.width as f64).round(), size.width),
            y: clamp_axis((self.y * size.height as f64).round(), size.height),
        }
    }

    pub fn to_fixed(self) -> FixedPoint {
        let scale = FIXED_SCALE as f64;
        FixedPoint {
            x: (self.x * scale).round() as u16,
            y: (self.y * scale).round() as u16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPoint {
    pub x: u16,
    pub y: u16,
}

impl FixedPoint {
    /// 超出 [0,1000] 的分量会被夹回
    pub fn new(x: u16, y: u16) -> Self {
        Self {
            x: x.min(FIXED_SCALE),
            y: y.min(FIXED_SCALE),
        }
    }

    pub fn to_normalized(self) -> NormalizedPoint {
        let scale = FIXED_SCALE as f64;
        NormalizedPoint::new(self.x as f64 / scale, self.y as f64 / scale)
    }

    pub fn to_pixel(self, size: DeviceSize) -> PixelPoint {
        self.to_normalized().to_pixel(size)
    }
}

/// 动作里携带的坐标，三种表示之一
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "space", rename_all = "snake_case")]
pub enum Point {
    Pixel { x: i32, y: i32 },
    Normalized { x: f64, y: f64 },
    Fixed { x: u16, y: u16 },
}

impl Point {
    pub fn pixel(x: i32, y: i32) -> Self {
        Point::Pixel { x, y }
    }

    pub fn normalized(x: f64, y: f64) -> Self {
        let p = NormalizedPoint::new(x, y);
        Point::Normalized { x: p.x, y: p.y }
    }

    pub fn fixed(x: u16, y: u16) -> Self {
        let p = FixedPoint::new(x, y);
        Point::Fixed { x: p.x, y: p.y }
    }

    /// 投影到当前设备尺寸上的像素坐标，结果总在 [0, 尺寸) 内
    pub fn to_pixel(&self, size: DeviceSize) -> PixelPoint {
        match *self {
            Point::Pixel { x, y } => PixelPoint::new(x, y).clamped(size),
            Point::Normalized { x, y } => NormalizedPoint::new(x, y).to_pixel(size),
            Point::Fixed { x, y } => FixedPoint::new(x, y).to_pixel(size),
        }
    }
}

fn unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn clamp_axis(v: f64, extent: u32) -> i32 {
    if extent == 0 {
        return 0;
    }
    let max = (extent - 1) as f64;
    v.clamp(0.0, max) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_center_to_pixel() {
        let size = DeviceSize::new(1080, 2400);
        assert_eq!(FixedPoint::new(500, 500).to_pixel(size), PixelPoint::new(540, 1200));
    }

    #[test]
    fn test_fixed_edges_stay_inside_screen() {
        let size = DeviceSize::new(1080, 2400);
        for (x, y) in [(0, 0), (1000, 1000), (999, 1), (1000, 0), (1200, 5000)] {
            let p = Point::fixed(x, y).to_pixel(size);
            assert!(p.x >= 0 && p.x < 1080, "x out of range: {:?}", p);
            assert!(p.y >= 0 && p.y < 2400, "y out of range: {:?}", p);
        }
    }

    #[test]
    fn test_every_fixed_value_maps_inside() {
        let size = DeviceSize::new(720, 1600);
        for v in 0..=1000u16 {
            let p = FixedPoint::new(v, 1000 - v).to_pixel(size);
            assert!((0..720).contains(&p.x));
            assert!((0..1600).contains(&p.y));
        }
    }

    #[test]
    fn test_normalized_fixed_roundtrip_error_bound() {
        let mut v = 0.0;
        while v <= 1.0 {
            let n = NormalizedPoint::new(v, 1.0 - v);
            let back = n.to_fixed().to_normalized();
            assert!((back.x - n.x).abs() <= 0.001 + f64::EPSILON);
            assert!((back.y - n.y).abs() <= 0.001 + f64::EPSILON);
            v += 0.0137;
        }
    }

    #[test]
    fn test_pixel_clamped_and_rounding() {
        let size = DeviceSize::new(100, 200);
        assert_eq!(Point::pixel(-5, 900).to_pixel(size), PixelPoint::new(0, 199));
        // 0.5049 * 100 = 50.49 -> 50
        assert_eq!(Point::normalized(0.5049, 0.0).to_pixel(size), PixelPoint::new(50, 0));
    }

    #[test]
    fn test_zero_size_does_not_panic() {
        let p = Point::fixed(500, 500).to_pixel(DeviceSize::new(0, 0));
        assert_eq!(p, PixelPoint::new(0, 0));
    }
}
