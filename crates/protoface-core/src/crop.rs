//! Face selection and cropping.

use crate::types::BoundingBox;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CropError {
    #[error("bounding box has non-finite coordinates")]
    NonFinite,
    #[error("crop region has zero area after clamping to {width}x{height} image")]
    ZeroArea { width: u32, height: u32 },
}

/// Pick the single highest-confidence detection at or above `min_confidence`.
pub fn select_face(detections: &[BoundingBox], min_confidence: f32) -> Option<&BoundingBox> {
    detections
        .iter()
        .filter(|d| d.confidence.is_finite() && d.confidence >= min_confidence)
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Crop `face` out of `image`, growing the box by `margin` of its size on
/// every side and clamping to the image bounds.
pub fn crop_face(image: &RgbImage, face: &BoundingBox, margin: f32) -> Result<RgbImage, CropError> {
    let coords = [face.x, face.y, face.width, face.height, margin];
    if coords.iter().any(|v| !v.is_finite()) {
        return Err(CropError::NonFinite);
    }

    let (img_w, img_h) = image.dimensions();
    let margin = margin.max(0.0);
    let mx = face.width.max(0.0) * margin;
    let my = face.height.max(0.0) * margin;

    let x0 = (face.x - mx).floor().clamp(0.0, img_w as f32) as u32;
    let y0 = (face.y - my).floor().clamp(0.0, img_h as f32) as u32;
    let x1 = (face.x + face.width + mx).ceil().clamp(0.0, img_w as f32) as u32;
    let y1 = (face.y + face.height + my).ceil().clamp(0.0, img_h as f32) as u32;

    if face.width <= 0.0 || face.height <= 0.0 || x1 <= x0 || y1 <= y0 {
        return Err(CropError::ZeroArea { width: img_w, height: img_h });
    }

    Ok(image::imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf }
    }

    #[test]
    fn test_select_highest_confidence() {
        let dets = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.6),
            make_bbox(5.0, 5.0, 10.0, 10.0, 0.9),
            make_bbox(9.0, 9.0, 10.0, 10.0, 0.7),
        ];
        let face = select_face(&dets, 0.4).unwrap();
        assert!((face.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_select_respects_min_confidence() {
        let dets = vec![make_bbox(0.0, 0.0, 10.0, 10.0, 0.3)];
        assert!(select_face(&dets, 0.4).is_none());
        assert!(select_face(&[], 0.4).is_none());
    }

    #[test]
    fn test_crop_without_margin() {
        let img = RgbImage::new(100, 80);
        let crop = crop_face(&img, &make_bbox(10.0, 20.0, 30.0, 40.0, 0.9), 0.0).unwrap();
        assert_eq!(crop.dimensions(), (30, 40));
    }

    #[test]
    fn test_crop_margin_grows_box() {
        let img = RgbImage::new(100, 100);
        let crop = crop_face(&img, &make_bbox(40.0, 40.0, 20.0, 20.0, 0.9), 0.1).unwrap();
        assert_eq!(crop.dimensions(), (24, 24));
    }

    #[test]
    fn test_crop_clamps_to_image() {
        let img = RgbImage::new(50, 50);
        let crop = crop_face(&img, &make_bbox(-10.0, 30.0, 40.0, 40.0, 0.9), 0.0).unwrap();
        assert_eq!(crop.dimensions(), (30, 20));
    }

    #[test]
    fn test_crop_outside_image_is_zero_area() {
        let img = RgbImage::new(50, 50);
        let err = crop_face(&img, &make_bbox(60.0, 60.0, 10.0, 10.0, 0.9), 0.0).unwrap_err();
        assert_eq!(err, CropError::ZeroArea { width: 50, height: 50 });
    }

    #[test]
    fn test_crop_degenerate_box() {
        let img = RgbImage::new(50, 50);
        assert!(crop_face(&img, &make_bbox(10.0, 10.0, 0.0, 10.0, 0.9), 0.1).is_err());
        assert_eq!(
            crop_face(&img, &make_bbox(f32::NAN, 10.0, 5.0, 5.0, 0.9), 0.0),
            Err(CropError::NonFinite)
        );
    }
}
