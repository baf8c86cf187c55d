//! Drives the virtual texture through a synthetic camera flight.
//! Feeds generated feedback through readback, analysis and the frame update,
//! and checks residency invariants every frame.
//!
//! Usage: vt_simulate [config.toml] [frames]

use std::collections::HashSet;
use anyhow::{bail, Context, Result};
use adaptive_vt::{AdaptiveVirtualTexture, FeedbackSample, ImageId, ReadbackCompletion, VirtualTextureConfig};

const GRID: u32 = 4;
const CELL_SIZE: u32 = 32;
const SCREEN_WIDTH: u32 = 640;
const SCREEN_HEIGHT: u32 = 360;
const MAX_RENDER_REQUESTS: usize = 16;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info,adaptive_vt=info"))
        .format_timestamp_millis()
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => VirtualTextureConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => VirtualTextureConfig::default(),
    };
    let frames: u32 = match args.next() {
        Some(n) => n.parse().with_context(|| format!("invalid frame count {:?}", n))?,
        None => 240,
    };

    let mut vt = AdaptiveVirtualTexture::new(config)?;
    let mut cells: Vec<Option<ImageId>> = Vec::with_capacity((GRID * GRID) as usize);
    for _ in 0..GRID * GRID {
        cells.push(Some(vt.allocate(CELL_SIZE)?));
    }
    log::info!("[vt_simulate] Allocated {} images, running {} frames", cells.len(), frames);

    vt.readback_mut().refresh(SCREEN_WIDTH, SCREEN_HEIGHT);
    let completions = vt.readback().completion_sender();

    for step in 0..frames {
        churn_images(&mut vt, &mut cells, step)?;

        let samples = synthesize_feedback(&vt, &cells, step);
        completions
            .send(ReadbackCompletion { frame: vt.frame(), samples })
            .context("readback channel closed")?;
        vt.poll_readback();

        let task = vt.schedule_feedback_analysis();
        let update = vt.update_queued_requests(task, MAX_RENDER_REQUESTS);
        let copies = vt.copy_to_cache(&update.render_requests);

        check_invariants(&vt, update.stats.mapped, update.render_requests.len())?;
        log::debug!("[vt_simulate] Frame {}: {} uploads, {} copies", update.stats.frame, update.upload.updates.len(), copies.len());
    }

    let stats = vt.stats();
    log::info!("[vt_simulate] {} frames: {} pages mapped, {} evictions, {} remapped, {} deferred, peak residency {}/{}",
               stats.frames, stats.pages_mapped, stats.evictions, stats.remapped, stats.deferred,
               stats.peak_resident, vt.cache().page_count());
    Ok(())
}

/// Periodically resize one cell and free/reallocate another
fn churn_images(vt: &mut AdaptiveVirtualTexture, cells: &mut [Option<ImageId>], step: u32) -> Result<()> {
    let count = cells.len();

    if step % 37 == 36 {
        if let Some(id) = cells[(step as usize / 37) % count] {
            let size = vt.get(id)?.size as u32;
            let new_size = if size == CELL_SIZE { CELL_SIZE / 2 } else { CELL_SIZE };
            if let Err(e) = vt.resize(id, new_size) {
                log::warn!("[vt_simulate] Resize of image {} skipped: {}", id, e);
            }
        }
    }

    if step % 53 == 52 {
        let cell = (step as usize / 53 * 5) % count;
        match cells[cell].take() {
            Some(id) => vt.free(id)?,
            None => match vt.allocate(CELL_SIZE) {
                Ok(id) => cells[cell] = Some(id),
                Err(e) if e.is_retryable() => log::warn!("[vt_simulate] Allocation deferred: {}", e),
                Err(e) => return Err(e.into()),
            },
        }
    }

    Ok(())
}

/// Feedback of a camera circling over the grid: cells near the camera ask
/// for finer mips
fn synthesize_feedback(vt: &AdaptiveVirtualTexture, cells: &[Option<ImageId>], step: u32) -> Vec<i32> {
    let size = vt.readback().size();
    let angle = step as f32 * 0.05;
    let camera = glam::Vec2::new(angle.cos(), angle.sin()) * (GRID as f32 * 0.35) + GRID as f32 * 0.5;

    let mut samples = vec![0; (size.x * size.y) as usize];
    for py in 0..size.y {
        for px in 0..size.x {
            let world = glam::Vec2::new(
                (px as f32 + 0.5) / size.x as f32 * GRID as f32,
                (py as f32 + 0.5) / size.y as f32 * GRID as f32,
            );
            let cell = (world.y as u32).min(GRID - 1) * GRID + (world.x as u32).min(GRID - 1);
            let Some(image) = cells[cell as usize].and_then(|id| vt.get(id).ok()).filter(|i| i.is_live()) else {
                continue;
            };

            let local = world.fract() * image.size as f32;
            let distance = world.distance(camera);
            let mip = (distance * 1.5) as u32;

            samples[(py * size.x + px) as usize] =
                FeedbackSample::new(image.x as u32 + local.x as u32, image.y as u32 + local.y as u32, mip).encode();
        }
    }

    samples
}

fn check_invariants(vt: &AdaptiveVirtualTexture, mapped: usize, renders: usize) -> Result<()> {
    let mut hashes = HashSet::new();
    for page in vt.cache().pages().iter().filter(|p| p.is_mapped()) {
        if !hashes.insert(page.hash) {
            bail!("frame {}: page hash {:#09x} mapped twice", vt.frame() - 1, page.hash);
        }
    }

    let budget = MAX_RENDER_REQUESTS.min(vt.config().scratch_buffers_count as usize);
    if mapped > budget || renders > budget {
        bail!("frame {}: {} pages mapped, {} renders, budget {}", vt.frame() - 1, mapped, renders, budget);
    }

    Ok(())
}
