//! Detection overlays drawn directly on BGR frame buffers.
//!
//! Overlays are applied before the frame reaches the video sink or the JPEG
//! encoder, so recorded clips and the live stream show the same picture.

use anyhow::{Result, anyhow};
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};
use video_ingest::Frame;

use crate::sentry::data::DetectionSummary;

type Bgr = [u8; 3];

const GREEN: Bgr = [0, 255, 0];
const WHITE: Bgr = [255, 255, 255];
const BLACK: Bgr = [0, 0, 0];

/// Draw detection boxes and label plates onto the frame.
pub(crate) fn draw_detections(frame: &mut Frame, summaries: &[DetectionSummary]) {
    let width = frame.width;
    let height = frame.height;

    for summary in summaries {
        let left = summary.bbox[0].round() as i32;
        let top = summary.bbox[1].round() as i32;
        let right = summary.bbox[2].round() as i32;
        let bottom = summary.bbox[3].round() as i32;
        draw_rectangle(&mut frame.data, width, height, left, top, right, bottom, GREEN);
    }

    for summary in summaries {
        let label = format!("{} {:.0}%", summary.class, summary.score * 100.0);
        let label_x = summary.bbox[0].round() as i32;
        let label_y = (summary.bbox[1].round() as i32 - 12).max(0);
        let text_width = label.chars().count() as i32 * 6;
        fill_rect(
            &mut frame.data,
            width,
            height,
            label_x,
            label_y,
            label_x + text_width,
            label_y + 8,
            BLACK,
        );
        draw_label(&mut frame.data, width, height, label_x, label_y, &label, GREEN);
    }
}

/// Draw the frame counter / fps status line in the bottom-right corner.
pub(crate) fn draw_status_line(frame: &mut Frame, frame_number: u64, fps: f32) {
    let width = frame.width;
    let height = frame.height;
    let info = format!("FRAME {:06}  FPS {:4.1}", frame_number, fps);
    let info_width = (info.chars().count() as i32 * 6).min(width);
    let info_x = (width - info_width - 4).max(0);
    let info_y = (height - 12).max(0);
    fill_rect(
        &mut frame.data,
        width,
        height,
        info_x,
        info_y,
        info_x + info_width + 4,
        info_y + 8,
        BLACK,
    );
    draw_label(
        &mut frame.data,
        width,
        height,
        info_x + 2,
        info_y,
        &info,
        WHITE,
    );
}

/// Encode a BGR frame as JPEG.
pub(crate) fn encode_jpeg(frame: &Frame, quality: i32) -> Result<Vec<u8>> {
    let width = frame.width as u32;
    let height = frame.height as u32;
    let rgb = bgr_to_rgb(&frame.data);
    let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width, height, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    let mut buffer = Vec::new();
    let quality = quality.clamp(1, 100) as u8;
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;

    Ok(buffer)
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

fn set_pixel(data: &mut [u8], width: i32, x: i32, y: i32, color: Bgr) {
    let offset = ((y * width + x) * 3) as usize;
    data[offset..offset + 3].copy_from_slice(&color);
}

fn draw_rectangle(
    data: &mut [u8],
    width: i32,
    height: i32,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Bgr,
) {
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        set_pixel(data, width, x, top, color);
        set_pixel(data, width, x, bottom, color);
    }
    for y in top..=bottom {
        set_pixel(data, width, left, y, color);
        set_pixel(data, width, right, y, color);
    }
}

fn fill_rect(
    data: &mut [u8],
    width: i32,
    height: i32,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Bgr,
) {
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            set_pixel(data, width, x, y, color);
        }
    }
}

fn draw_label(data: &mut [u8], width: i32, height: i32, mut x: i32, y: i32, text: &str, color: Bgr) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            set_pixel(data, width, px, py, color);
                        }
                    }
                }
            }
        }
        x += 6;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([
            0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'F' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000,
        ]),
        'M' => Some([
            0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001,
        ]),
        'N' => Some([
            0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001,
        ]),
        'O' => Some([
            0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'P' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000,
        ]),
        'R' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001,
        ]),
        'S' => Some([
            0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        '%' => Some([
            0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000,
        ]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}
