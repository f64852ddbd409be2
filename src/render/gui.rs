use std::path::PathBuf;

use egui::{ComboBox, DragValue, Slider, Ui};
use log::error;

use crate::{camera::Camera, gpu::Device};

use super::{
    settings::{GeometryMode, Integrator, ShadingMode, Tonemap},
    Renderer,
};

fn combo<T: Copy + PartialEq>(
    ui: &mut Ui,
    label: &str,
    value: &mut T,
    options: &[T],
    name: impl Fn(T) -> &'static str,
) {
    ComboBox::from_label(label)
        .selected_text(name(*value))
        .show_ui(ui, |ui| {
            for &option in options {
                ui.selectable_value(value, option, name(option));
            }
        });
}

impl<D: Device> Renderer<D> {
    /// Render settings panel. Changes that alter the traced image reset accumulation.
    pub fn gui(&mut self, ui: &mut Ui) {
        let before = self.settings.clone();
        let stationary_frames = self.stationary_frames;
        let mut save = false;

        let settings = &mut self.settings;
        let image_path = &mut self.image_path;
        ui.indent("render_settings", |ui| {
            ui.horizontal(|ui| {
                save = ui.button("Save Image").clicked();
                ui.text_edit_singleline(image_path);
            });

            ui.horizontal(|ui| {
                ui.checkbox(&mut settings.accumulate, "");
                ui.label(format!("Stationary frames: {}", stationary_frames));
            });
            ui.horizontal(|ui| {
                ui.add(DragValue::new(&mut settings.max_stationary_frames).speed(128));
                ui.label("Max frames");
            });

            combo(
                ui,
                "Integrator",
                &mut settings.integrator,
                Integrator::ALL,
                Integrator::label,
            );
            match settings.integrator {
                Integrator::Geometry => combo(
                    ui,
                    "Geometry",
                    &mut settings.geometry_mode,
                    GeometryMode::ALL,
                    GeometryMode::label,
                ),
                Integrator::Shading => combo(
                    ui,
                    "Shading",
                    &mut settings.shading_mode,
                    ShadingMode::ALL,
                    ShadingMode::label,
                ),
                _ => {}
            }

            ui.checkbox(&mut settings.hdr, "HDR");
            ui.checkbox(&mut settings.shading_normals, "Shading Normals");
            ui.checkbox(&mut settings.roulette, "Roulette");
            combo(
                ui,
                "Tonemap",
                &mut settings.tonemap,
                Tonemap::ALL,
                Tonemap::label,
            );
            ui.add(Slider::new(&mut settings.samples_per_frame, 1..=32).text("Samples/Frame"));
            ui.add(
                Slider::new(&mut settings.suppress_fireflies, 0..=512).text("Suppress Fireflies"),
            );
            ui.add(Slider::new(&mut settings.max_depth, 1..=32).text("Max Depth"));
            ui.add(Slider::new(&mut settings.gamma, 1.0..=3.0).text("Gamma"));
            ui.add(Slider::new(&mut settings.exposure, 0.01..=10.0).text("Exposure"));
            ui.add(Slider::new(&mut settings.sun, 0.0..=10.0).text("Sun"));
        });

        if before.resets_accumulation(&self.settings) {
            self.needs_reset = true;
        }
        if save {
            if let Err(error) = self.save_image(self.image_path.clone()) {
                error!("Failed to save image: {:#}", error);
            }
        }
    }

    /// Scene picker panel. Also swaps in a scene whose load finished since the last frame.
    pub fn pick_scene(&mut self, camera: &mut Camera, ui: &mut Ui) {
        self.poll_scene(camera);

        let loading = self.is_loading();
        let stats = self.scene.stats();
        let mut open = false;
        let mut clear = false;

        let scene_path = &mut self.scene_path;
        let parallelism = &mut self.settings.max_parallelism;
        ui.indent("scene_picker", |ui| {
            ui.horizontal(|ui| {
                ui.text_edit_singleline(scene_path);
                if loading {
                    ui.spinner();
                } else {
                    open = ui.button("Open").clicked();
                    clear = ui.button("Clear").clicked();
                }
            });
            ui.add(Slider::new(parallelism, 1..=64).text("Parallelism"));
            ui.label(format!(
                "{} instances, {} geometries, {} materials, {} images, {} lights",
                stats.instances, stats.geometry_references, stats.materials, stats.images, stats.lights
            ));
        });

        if open && !self.scene_path.is_empty() {
            self.load_scene(PathBuf::from(&self.scene_path));
        }
        if clear {
            if let Err(error) = self.clear_scene() {
                error!("Failed to clear scene: {:#}", error);
            }
        }
    }
}
