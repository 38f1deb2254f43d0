use ndarray::Array3;
use video_proto::Detection;

const OUTLINE_THICKNESS: i64 = 2;

/// Draws a fixed-style rectangle outline for every detection onto the decoded
/// pixel array, clipped to the image bounds. Zero-area or fully out-of-bounds
/// boxes are skipped. The array is the service's own copy of the frame, so
/// drawing in place is safe.
pub fn draw_detections(pixels: &mut Array3<u8>, detections: &[Detection]) {
    for detection in detections {
        let Some(bbox) = &detection.bbox else {
            continue;
        };
        if bbox.width <= 0. || bbox.height <= 0. {
            continue;
        }

        let x0 = bbox.x as i64;
        let y0 = bbox.y as i64;
        let x1 = (bbox.x + bbox.width) as i64;
        let y1 = (bbox.y + bbox.height) as i64;

        let t = OUTLINE_THICKNESS;
        fill_rect(pixels, x0, y0, x1, y0 + t - 1);
        fill_rect(pixels, x0, y1 - t + 1, x1, y1);
        fill_rect(pixels, x0, y0, x0 + t - 1, y1);
        fill_rect(pixels, x1 - t + 1, y0, x1, y1);
    }
}

/// Paints the intersection of an inclusive pixel rectangle with the image.
fn fill_rect(pixels: &mut Array3<u8>, x0: i64, y0: i64, x1: i64, y1: i64) {
    let (height, width, _) = pixels.dim();

    let x_start = x0.max(0) as usize;
    let y_start = y0.max(0) as usize;
    let x_end = x1.min(width as i64 - 1);
    let y_end = y1.min(height as i64 - 1);
    if x_end < x_start as i64 || y_end < y_start as i64 {
        return;
    }

    for y in y_start..=y_end as usize {
        for x in x_start..=x_end as usize {
            paint(pixels, y, x);
        }
    }
}

// Green outline on color frames, white on grayscale; painted RGBA pixels are
// forced opaque. The same channel triple is green under RGB24 and BGR24.
fn paint(pixels: &mut Array3<u8>, y: usize, x: usize) {
    match pixels.dim().2 {
        1 => pixels[[y, x, 0]] = 255,
        channels => {
            pixels[[y, x, 0]] = 0;
            pixels[[y, x, 1]] = 255;
            pixels[[y, x, 2]] = 0;
            if channels > 3 {
                pixels[[y, x, 3]] = 255;
            }
        }
    }
}
