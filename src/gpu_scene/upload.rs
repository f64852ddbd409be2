//! The phased upload of a CPU scene.
//!
//! Phases run in order: top level BLASes, object BLASes and geometry, traversal, TLASes,
//! textures, geometry references, materials and lights. Within a phase, writes run on
//! blocking workers, at most `parallelism` at a time. When an allocation runs out of memory
//! the in flight writes are drained once, releasing their staging memory, and the
//! allocation is retried. A second failure skips the resource with a warning.

use std::sync::Arc;

use ash::vk;
use log::{info, warn};

use crate::{
    async_pool::{self, BoundedTasks},
    gpu::{Alloc, Device, SamplerConfig},
    time::Stopwatch,
};

use super::{
    format::{ImageKey, MeshGroup, ObjectTable, TextureMaps, Traversal, UploadFormat},
    resources::{
        allocate_blas, allocate_buffer, allocate_geometry, allocate_image, allocate_tlas,
        write_blas, write_buffer, write_geometry, write_image, write_records, write_tlas,
        GeometryResult,
    },
    types::{
        CpuGeometryReference, GpuDeltaLight, GpuGeometryReference, GpuMaterial, TextureId,
        TlasInstance, MAX_IMAGES, MAX_SAMPLERS,
    },
    Scene,
};

type BlasTasks<D> = BoundedTasks<Option<<D as Device>::AccelerationStructure>>;
type GeometryTasks<D> = BoundedTasks<GeometryResult<<D as Device>::Buffer>>;

fn warn_skipped<T>(what: &str, alloc: &Alloc<T>) {
    match alloc {
        Alloc::StagingFull => warn!("{} too large for staging heap.", what),
        Alloc::DeviceFull => warn!("{} too large for device heap.", what),
        Alloc::Success(_) => {}
    }
}

fn gpu_reference(reference: &CpuGeometryReference, maps: &TextureMaps) -> GpuGeometryReference {
    let alpha_texture_id = match reference.alpha_texture_id {
        u32::MAX => TextureId::NONE,
        texture => maps.image_id(texture as usize),
    };
    GpuGeometryReference {
        vertex_address: reference.vertex_address,
        index_address: reference.index_address,
        material_id: reference.material_id,
        alpha_texture_id,
        alpha_cutoff: reference.alpha_cutoff,
        flags: reference.flags,
        emission: reference.emission.into(),
    }
}

impl<D: Device> Scene<D> {
    pub(super) async fn upload<F: UploadFormat>(
        &mut self,
        cpu: Arc<F>,
        parallelism: usize,
    ) -> anyhow::Result<()> {
        if cpu.has_top_level() {
            self.upload_top_level(&cpu).await;
        }
        self.upload_objects(&cpu, parallelism).await;

        let traversal = self.traverse(cpu.as_ref());
        self.upload_tlases(&traversal).await;

        self.upload_textures(&cpu, parallelism).await?;
        self.upload_geometry_references().await;
        self.upload_materials(&cpu).await;
        self.upload_lights(&cpu, &traversal).await;

        self.recreate_set()
    }

    fn push_geometry(&mut self, result: GeometryResult<D::Buffer>) {
        self.object_to_geometry_index
            .push(self.cpu_geometry_references.len() as u64);
        self.geometry_buffers.push(result.buffer);
        self.cpu_geometry_references.extend(result.references);
    }

    async fn drain(&mut self, blas_tasks: &mut BlasTasks<D>, geometry_tasks: &mut GeometryTasks<D>) {
        self.object_blases.extend(blas_tasks.drain().await);
        for result in geometry_tasks.drain().await {
            self.push_geometry(result);
        }
    }

    /// Top level meshes go into two groups, one of them emissive. Neither is retried.
    async fn upload_top_level<F: UploadFormat>(&mut self, cpu: &Arc<F>) {
        let stopwatch = Stopwatch::start();
        let mut mesh_count = 0;

        for (group, label) in [
            (MeshGroup::TopLevel { emissive: false }, "Top level"),
            (MeshGroup::TopLevel { emissive: true }, "Emissive"),
        ] {
            let meshes = cpu.meshes(group);
            mesh_count += meshes.len();

            let blas = allocate_blas(self.device.as_ref(), &meshes);
            let geometry = allocate_geometry(self.device.as_ref(), &meshes);

            let blas = match blas {
                Alloc::Success(upload) => {
                    let (device, cpu) = (self.device.clone(), cpu.clone());
                    async_pool::suspend(move || {
                        write_blas(device.as_ref(), upload, &cpu.meshes(group))
                    })
                    .await
                }
                failed => {
                    warn_skipped(&format!("{} BLAS", label), &failed);
                    None
                }
            };
            self.object_blases.push(blas);

            let geometry = match geometry {
                Alloc::Success(upload) => {
                    let (device, cpu) = (self.device.clone(), cpu.clone());
                    async_pool::suspend(move || {
                        write_geometry(device.as_ref(), upload, &cpu.meshes(group))
                    })
                    .await
                }
                failed => {
                    warn_skipped(&format!("{} geometry", label), &failed);
                    GeometryResult::default()
                }
            };
            self.push_geometry(geometry);
        }

        info!(
            "Built top level BLASes for {} meshes in {:.2} ms.",
            mesh_count,
            stopwatch.ms()
        );
    }

    async fn upload_objects<F: UploadFormat>(&mut self, cpu: &Arc<F>, parallelism: usize) {
        let stopwatch = Stopwatch::start();
        let mut blas_tasks: BlasTasks<D> = BoundedTasks::new(parallelism);
        let mut geometry_tasks: GeometryTasks<D> = BoundedTasks::new(parallelism);

        for index in 0..cpu.object_count() {
            if blas_tasks.is_full() || geometry_tasks.is_full() {
                self.drain(&mut blas_tasks, &mut geometry_tasks).await;
            }
            let group = MeshGroup::Object(index);

            let mut blas = allocate_blas(self.device.as_ref(), &cpu.meshes(group));
            if blas.out_of_memory() {
                self.drain(&mut blas_tasks, &mut geometry_tasks).await;
                blas = allocate_blas(self.device.as_ref(), &cpu.meshes(group));
            }
            match blas {
                Alloc::Success(upload) => {
                    let (device, cpu) = (self.device.clone(), cpu.clone());
                    blas_tasks.spawn_blocking(move || {
                        write_blas(device.as_ref(), upload, &cpu.meshes(group))
                    });
                }
                failed => {
                    warn_skipped("BLAS", &failed);
                    blas_tasks.ready(None);
                }
            }

            let mut geometry = allocate_geometry(self.device.as_ref(), &cpu.meshes(group));
            if geometry.out_of_memory() {
                self.drain(&mut blas_tasks, &mut geometry_tasks).await;
                geometry = allocate_geometry(self.device.as_ref(), &cpu.meshes(group));
            }
            match geometry {
                Alloc::Success(upload) => {
                    let (device, cpu) = (self.device.clone(), cpu.clone());
                    geometry_tasks.spawn_blocking(move || {
                        write_geometry(device.as_ref(), upload, &cpu.meshes(group))
                    });
                }
                failed => {
                    warn_skipped("Geometry", &failed);
                    geometry_tasks.ready(GeometryResult::default());
                }
            }
        }
        self.drain(&mut blas_tasks, &mut geometry_tasks).await;

        if cpu.has_top_level() {
            info!(
                "Built {} instance BLASes for {} meshes in {:.2} ms.",
                cpu.object_count(),
                cpu.mesh_count(),
                stopwatch.ms()
            );
        } else {
            info!(
                "Built {} mesh BLASes in {:.2} ms.",
                cpu.object_count(),
                stopwatch.ms()
            );
        }
    }

    fn traverse<F: UploadFormat>(&self, cpu: &F) -> Traversal {
        let stopwatch = Stopwatch::start();
        let blas_addresses: Vec<Option<u64>> = self
            .object_blases
            .iter()
            .map(|blas| {
                blas.as_ref()
                    .map(|blas| self.device.acceleration_structure_address(blas))
            })
            .collect();
        let traversal = cpu.traverse(&ObjectTable {
            blas_addresses: &blas_addresses,
            geometry_index: &self.object_to_geometry_index,
        });
        info!("Traversed scene in {:.2} ms.", stopwatch.ms());
        traversal
    }

    async fn build_tlas(
        &self,
        instances: Vec<TlasInstance>,
        label: &str,
    ) -> Option<D::AccelerationStructure> {
        let alloc = allocate_tlas(self.device.as_ref(), &instances);
        match alloc {
            Alloc::Success(upload) => {
                let device = self.device.clone();
                async_pool::suspend(move || write_tlas(device.as_ref(), upload, &instances)).await
            }
            failed => {
                warn_skipped(label, &failed);
                None
            }
        }
    }

    async fn upload_tlases(&mut self, traversal: &Traversal) {
        let stopwatch = Stopwatch::start();
        self.tlas = self.build_tlas(traversal.instances.clone(), "TLAS").await;
        self.emissive_tlas = self
            .build_tlas(traversal.emissive_instances.clone(), "Emissive TLAS")
            .await;
        self.instance_count = traversal.instances.len();
        self.emissive_instance_count = traversal.emissive_instances.len();
        info!(
            "Built TLASes from {} instances ({} emissive) in {:.2} ms.",
            self.instance_count,
            self.emissive_instance_count,
            stopwatch.ms()
        );
    }

    /// Slot of the sampler with `config`, creating it on first use.
    fn sampler_slot(&mut self, config: SamplerConfig) -> anyhow::Result<u64> {
        if let Some(&slot) = self.sampler_slots.get(&config) {
            return Ok(slot);
        }
        let sampler = self.device.create_sampler(&config)?;
        let slot = self.samplers.len() as u64;
        self.samplers.push(sampler);
        self.sampler_slots.insert(config, slot);
        Ok(slot)
    }

    async fn upload_textures<F: UploadFormat>(
        &mut self,
        cpu: &Arc<F>,
        parallelism: usize,
    ) -> anyhow::Result<()> {
        let stopwatch = Stopwatch::start();
        for config in cpu.reserved_samplers() {
            self.sampler_slot(config)?;
        }

        let texture_count = cpu.texture_count();
        let mut maps = TextureMaps {
            image: Vec::with_capacity(texture_count),
            sampler: Vec::with_capacity(texture_count),
        };
        let mut tasks: BoundedTasks<Option<D::Image>> = BoundedTasks::new(parallelism);
        let mut image_count = 0u64;

        for texture in 0..texture_count {
            maps.sampler
                .push(self.sampler_slot(cpu.sampler_config(texture))?);
            if !cpu.has_image(texture) {
                maps.image.push(u64::MAX);
                continue;
            }
            maps.image.push(image_count);
            image_count += 1;

            if tasks.is_full() {
                self.images.extend(tasks.drain().await);
            }
            let key = ImageKey::Texture(texture);
            let Some(source) = cpu.image(key) else {
                tasks.ready(None);
                continue;
            };

            let mut image = allocate_image(self.device.as_ref(), &source);
            if image.out_of_memory() {
                self.images.extend(tasks.drain().await);
                image = allocate_image(self.device.as_ref(), &source);
            }
            match image {
                Alloc::Success(upload) => {
                    let (device, cpu) = (self.device.clone(), cpu.clone());
                    tasks.spawn_blocking(move || {
                        write_image(device.as_ref(), upload, &cpu.image(key)?)
                    });
                }
                failed => {
                    warn_skipped("Image", &failed);
                    tasks.ready(None);
                }
            }
        }
        self.images.extend(tasks.drain().await);
        self.texture_maps = maps;

        if image_count > MAX_IMAGES {
            warn!(
                "Scene has {} images, only the first {} are bound.",
                image_count, MAX_IMAGES
            );
        }
        if self.samplers.len() as u64 > MAX_SAMPLERS {
            warn!(
                "Scene has {} samplers, only the first {} are bound.",
                self.samplers.len(),
                MAX_SAMPLERS
            );
        }
        info!(
            "Built {} images from {} textures in {:.2} ms.",
            image_count,
            texture_count,
            stopwatch.ms()
        );
        Ok(())
    }

    async fn upload_geometry_references(&mut self) {
        let stopwatch = Stopwatch::start();
        let references = self.cpu_geometry_references.clone();
        let size = (references.len() * std::mem::size_of::<GpuGeometryReference>()) as u64;

        let alloc = allocate_buffer(
            self.device.as_ref(),
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        );
        self.geometry_references = match alloc {
            Alloc::Success(upload) => {
                let (device, maps) = (self.device.clone(), self.texture_maps.clone());
                async_pool::suspend(move || {
                    write_buffer(device.as_ref(), upload, |map| {
                        write_records(
                            map,
                            references.iter().map(|reference| gpu_reference(reference, &maps)),
                        )
                    })
                })
                .await
            }
            failed => {
                warn_skipped("Geometry references", &failed);
                None
            }
        };
        info!(
            "Built {} geometry references in {:.2} ms.",
            self.cpu_geometry_references.len(),
            stopwatch.ms()
        );
    }

    async fn upload_materials<F: UploadFormat>(&mut self, cpu: &Arc<F>) {
        let stopwatch = Stopwatch::start();
        let count = cpu.material_count();
        let size = (count * std::mem::size_of::<GpuMaterial>()) as u64;

        let alloc = allocate_buffer(
            self.device.as_ref(),
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        );
        self.materials = match alloc {
            Alloc::Success(upload) => {
                let (device, cpu, maps) =
                    (self.device.clone(), cpu.clone(), self.texture_maps.clone());
                async_pool::suspend(move || {
                    write_buffer(device.as_ref(), upload, |map| {
                        write_records(map, (0..count).map(|i| cpu.material(i, &maps)))
                    })
                })
                .await
            }
            failed => {
                warn_skipped("Materials", &failed);
                None
            }
        };
        self.material_count = count;
        info!("Built {} materials in {:.2} ms.", count, stopwatch.ms());
    }

    async fn upload_lights<F: UploadFormat>(&mut self, cpu: &Arc<F>, traversal: &Traversal) {
        let stopwatch = Stopwatch::start();
        let lights = cpu.delta_lights(traversal);
        let size = (lights.len() * std::mem::size_of::<GpuDeltaLight>()) as u64;
        self.light_count = lights.len();

        let alloc = allocate_buffer(
            self.device.as_ref(),
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        );
        self.lights = match alloc {
            Alloc::Success(upload) => {
                let (device, cpu) = (self.device.clone(), cpu.clone());
                async_pool::suspend(move || {
                    write_buffer(device.as_ref(), upload, |map| {
                        write_records(
                            map,
                            lights
                                .iter()
                                .map(|&(transform, index)| cpu.delta_light(transform, index)),
                        )
                    })
                })
                .await
            }
            failed => {
                warn_skipped("Lights", &failed);
                None
            }
        };

        for index in cpu.environment_lights() {
            if self.environment_map.is_some() {
                warn!("Multiple environment maps detected, only the first one will be used.");
                continue;
            }
            let key = ImageKey::Environment(index);
            let Some(source) = cpu.image(key) else {
                continue;
            };
            let alloc = allocate_image(self.device.as_ref(), &source);
            match alloc {
                Alloc::Success(upload) => {
                    let (device, cpu) = (self.device.clone(), cpu.clone());
                    self.environment_map = async_pool::suspend(move || {
                        write_image(device.as_ref(), upload, &cpu.image(key)?)
                    })
                    .await;
                }
                failed => warn_skipped("Envmap", &failed),
            }
        }

        info!(
            "Built {} lights in {:.2} ms.",
            cpu.light_count(),
            stopwatch.ms()
        );
    }
}
