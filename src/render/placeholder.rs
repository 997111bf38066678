use image::{imageops, Rgba, RgbaImage};

const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Frame substituted for the capture while the recorded region is hidden.
///
/// A black canvas with a white "paused" pictogram (framed pair of bars)
/// in the centre. Generated once per session.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderImage {
    image: RgbaImage,
}

impl PlaceholderImage {
    pub fn generate(width: u32, height: u32) -> Self {
        let mut image = RgbaImage::from_pixel(width.max(1), height.max(1), BLACK);
        let (w, h) = image.dimensions();

        let side = (w.min(h) / 4).max(4);
        let stroke = (side / 12).max(1);
        let left = (w - side.min(w)) / 2;
        let top = (h - side.min(h)) / 2;

        // frame
        fill_rect(&mut image, left, top, side, stroke);
        fill_rect(&mut image, left, top + side - stroke, side, stroke);
        fill_rect(&mut image, left, top, stroke, side);
        fill_rect(&mut image, left + side - stroke, top, stroke, side);

        // bars
        let bar_w = side / 6;
        let bar_h = side / 2;
        let bar_top = top + (side - bar_h) / 2;
        fill_rect(&mut image, left + side / 2 - bar_w - bar_w / 2, bar_top, bar_w, bar_h);
        fill_rect(&mut image, left + side / 2 + bar_w / 2, bar_top, bar_w, bar_h);

        Self { image }
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Copy scaled to the given frame size.
    pub fn scaled_to(&self, width: u32, height: u32) -> RgbaImage {
        if self.image.dimensions() == (width, height) {
            return self.image.clone();
        }
        imageops::resize(&self.image, width, height, imageops::FilterType::Nearest)
    }
}

fn fill_rect(image: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32) {
    let (iw, ih) = image.dimensions();
    for py in y..(y + h).min(ih) {
        for px in x..(x + w).min(iw) {
            image.put_pixel(px, py, WHITE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_is_black_with_white_mark() {
        let p = PlaceholderImage::generate(1280, 720);
        assert_eq!(p.dimensions(), (1280, 720));
        assert_eq!(*p.image().get_pixel(0, 0), BLACK);
        assert_eq!(*p.image().get_pixel(1279, 719), BLACK);
        let white = p.image().pixels().filter(|px| **px == WHITE).count();
        assert!(white > 0);
        assert!(white < 1280 * 720 / 10);
    }

    #[test]
    fn test_tiny_placeholder_does_not_panic() {
        let p = PlaceholderImage::generate(2, 2);
        assert_eq!(p.dimensions(), (2, 2));
        let p = PlaceholderImage::generate(0, 0);
        assert_eq!(p.dimensions(), (1, 1));
    }

    #[test]
    fn test_scaled_copy() {
        let p = PlaceholderImage::generate(64, 64);
        assert_eq!(p.scaled_to(64, 64), *p.image());
        assert_eq!(p.scaled_to(32, 16).dimensions(), (32, 16));
    }
}
