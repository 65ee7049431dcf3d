//! Overlay painting.
//!
//! [`render_overlay`] is a pure function of its inputs: it wipes the
//! surface, then draws one box and verdict label per scored face, the
//! descriptor lines under the detected face, and an optional FPS counter.

use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::glyphs::{draw_text, text_height};
use crate::liveness::Verdict;
use crate::types::{BoundingBox, DetectionReport, FaceDescriptor};

pub const LIVE_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
pub const SPOOF_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
pub const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

const BOX_THICKNESS: i32 = 3;
const LABEL_SCALE: u32 = 2;
const LABEL_GAP: i32 = 4;

pub fn render_overlay(surface: &mut RgbaImage, report: Option<&DetectionReport>, fps: Option<f32>) {
    for pixel in surface.pixels_mut() {
        *pixel = CLEAR;
    }
    if surface.width() == 0 || surface.height() == 0 {
        return;
    }

    if let Some(report) = report {
        if report.faces.is_empty() {
            draw_labelled_box(surface, &report.face, report.verdict, report.verdict.label());
        }
        for face in &report.faces {
            let label = format!("{} {}%", face.verdict.label(), face.record.percent());
            draw_labelled_box(surface, &face.record.bounds(), face.verdict, &label);
        }
        if let Some(descriptor) = &report.descriptor {
            let line_height = text_height(LABEL_SCALE) as i32 + LABEL_GAP;
            let x = report.face.left.round() as i32;
            let mut y = report.face.bottom.round() as i32 + LABEL_GAP + BOX_THICKNESS;
            for line in descriptor_lines(descriptor) {
                draw_text(surface, x, y, &line, TEXT_COLOR, LABEL_SCALE);
                y += line_height;
            }
        }
    }

    if let Some(fps) = fps {
        let text = format!("FPS: {}", fps.round().max(0.0) as u32);
        draw_text(surface, LABEL_GAP, LABEL_GAP, &text, TEXT_COLOR, LABEL_SCALE);
    }
}

/// Text lines for the signals a descriptor carries, in display order.
pub fn descriptor_lines(descriptor: &FaceDescriptor) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(gender) = &descriptor.gender {
        lines.push(format!(
            "GENDER: {}% {}",
            percent(gender.probability),
            gender.gender.to_string().to_uppercase()
        ));
    }
    if let Some(expression) = &descriptor.expression {
        lines.push(format!(
            "EXPRESSION: {}% {}",
            percent(expression.probability),
            expression.label.to_uppercase()
        ));
    }
    if let Some(age) = descriptor.age {
        lines.push(format!("AGE: {} YEARS", age.round() as i32));
    }
    if let Some(pose) = &descriptor.pose {
        lines.push(format!(
            "ROLL:{} PITCH:{} YAW:{}",
            pose.roll.round() as i32,
            pose.pitch.round() as i32,
            pose.yaw.round() as i32
        ));
    }
    lines
}

fn percent(probability: f32) -> u32 {
    (probability.clamp(0.0, 1.0) * 100.0).round() as u32
}

fn draw_labelled_box(surface: &mut RgbaImage, bbox: &BoundingBox, verdict: Verdict, label: &str) {
    let color = if verdict.is_live() {
        LIVE_COLOR
    } else {
        SPOOF_COLOR
    };
    draw_box(surface, bbox, color);

    let left = bbox.left.round() as i32;
    let above = bbox.top.round() as i32 - LABEL_GAP - text_height(LABEL_SCALE) as i32;
    // Labels that would leave the surface go just inside the box instead.
    let y = if above >= 0 {
        above
    } else {
        bbox.top.round() as i32 + BOX_THICKNESS + LABEL_GAP
    };
    draw_text(surface, left + BOX_THICKNESS, y, label, color, LABEL_SCALE);
}

fn draw_box(surface: &mut RgbaImage, bbox: &BoundingBox, color: Rgba<u8>) {
    let left = bbox.left.round() as i32;
    let top = bbox.top.round() as i32;
    let width = bbox.width().round() as i32;
    let height = bbox.height().round() as i32;
    for inset in 0..BOX_THICKNESS {
        let w = width - 2 * inset;
        let h = height - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(left + inset, top + inset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(surface, rect, color);
    }
}
