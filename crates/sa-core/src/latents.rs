use image::{imageops, Rgb, RgbImage};

/// Latent channels of an SD v1.x VAE
pub const LATENT_CHANNELS: usize = 4;

/// Spatial downsampling between pixels and latents
pub const LATENT_SCALE: u32 = 8;

/// Linear latent -> RGB approximation for SD v1.5 latents.
/// Rows are latent channels, columns are R, G, B.
const V1_5_LATENT_RGB_FACTORS: [[f32; 3]; LATENT_CHANNELS] = [
    [0.3444, 0.1385, 0.0670],
    [0.1247, 0.4027, 0.1494],
    [-0.3192, 0.2513, 0.2103],
    [-0.1307, -0.1874, -0.7445],
];

/// Intermediate latent state of one image, channel-major (CHW)
#[derive(Debug, Clone, PartialEq)]
pub struct Latents {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl Latents {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), LATENT_CHANNELS * plane_len(width, height));
        Self { width, height, data }
    }

    pub fn zeros(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0.0; LATENT_CHANNELS * plane_len(width, height)])
    }

    pub fn get(&self, channel: usize, x: u32, y: u32) -> f32 {
        let plane = plane_len(self.width, self.height);
        self.data[channel * plane + y as usize * self.width as usize + x as usize]
    }

    /// Cheap human-viewable preview without running the VAE decoder,
    /// upscaled back to pixel resolution with nearest-neighbour filtering.
    pub fn to_preview(&self) -> RgbImage {
        let mut small = RgbImage::new(self.width, self.height);

        for (x, y, pixel) in small.enumerate_pixels_mut() {
            let mut rgb = [0f32; 3];
            for (channel, factors) in V1_5_LATENT_RGB_FACTORS.iter().enumerate() {
                let value = self.get(channel, x, y);
                for (c, factor) in rgb.iter_mut().zip(factors) {
                    *c += value * factor;
                }
            }
            *pixel = Rgb(rgb.map(|c| (((c + 1.0) / 2.0).clamp(0.0, 1.0) * 255.0) as u8));
        }

        imageops::resize(
            &small,
            self.width * LATENT_SCALE,
            self.height * LATENT_SCALE,
            imageops::FilterType::Nearest,
        )
    }
}

fn plane_len(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_latents_preview_mid_gray() {
        let preview = Latents::zeros(4, 2).to_preview();
        assert_eq!(preview.dimensions(), (32, 16));
        assert_eq!(preview.get_pixel(0, 0), &Rgb([127, 127, 127]));
    }

    #[test]
    fn test_preview_clamps() {
        let latents = Latents::new(1, 1, vec![100.0, 0.0, 0.0, 0.0]);
        let preview = latents.to_preview();
        assert_eq!(preview.get_pixel(0, 0), &Rgb([255, 255, 255]));

        let latents = Latents::new(1, 1, vec![0.0, 0.0, 0.0, 100.0]);
        assert_eq!(latents.to_preview().get_pixel(3, 3), &Rgb([0, 0, 0]));
    }
}
