//! Turning a group's configured indices into concrete resources.

use groupconfig::SwapchainMatchMode;
use pipestate::{ApiError, Device, Format, ResourceHandle, ResourceViewHandle};

const ASPECT_TOLERANCE: f64 = 0.1;
const MIN_MULTIPLIER: f64 = 0.5;
const MAX_MULTIPLIER: f64 = 1.85;
const SCALE_TOLERANCE: f64 = 0.05;

#[derive(Debug, thiserror::Error)]
pub enum ResolveFailure {
    #[error("nothing is bound at the requested slot")]
    NothingBound,
    #[error("target {target:?} does not match swapchain {swapchain:?}")]
    SwapchainMismatch { target: (u32, u32), swapchain: (u32, u32) },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A view together with what the core needs to know about its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedView {
    pub view: ResourceViewHandle,
    pub resource: ResourceHandle,
    pub format: Format,
    pub extent: (u32, u32),
}

/// Index into `count` bound entries; the configured index is clamped to the
/// last entry and nothing resolves when nothing is bound.
pub fn resolve_index(index: u32, count: usize) -> Option<usize> {
    if count == 0 {
        None
    } else {
        Some((index as usize).min(count - 1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDirection {
    Up,
    Down,
}

/// Steps `current` to the next valid entry in `direction`. Invalid entries
/// are skipped and the walk stops at the array bounds instead of wrapping.
pub fn cycle_index(
    current: u32,
    len: usize,
    direction: CycleDirection,
    is_valid: impl Fn(usize) -> bool,
) -> u32 {
    let current = current as usize;
    let next = match direction {
        CycleDirection::Up => (current + 1..len).find(|index| is_valid(*index)),
        CycleDirection::Down => (0..current.min(len)).rev().find(|index| is_valid(*index)),
    };
    next.unwrap_or_else(|| current.min(len.saturating_sub(1))) as u32
}

fn aspect(extent: (u32, u32)) -> f64 {
    f64::from(extent.0) / f64::from(extent.1.max(1))
}

fn near_integer(value: f64) -> Option<f64> {
    let rounded = value.round();
    (rounded >= 1.0 && (value - rounded).abs() <= SCALE_TOLERANCE).then_some(rounded)
}

/// Whether a render target of `target` size may receive effects for a
/// swapchain of `swapchain` size.
pub fn matches_swapchain(mode: SwapchainMatchMode, target: (u32, u32), swapchain: (u32, u32)) -> bool {
    if target.0 == 0 || target.1 == 0 {
        return false;
    }
    let aspect_close = (aspect(target) - aspect(swapchain)).abs() <= ASPECT_TOLERANCE;
    match mode {
        SwapchainMatchMode::None => true,
        SwapchainMatchMode::Resolution => target == swapchain,
        SwapchainMatchMode::AspectRatio => {
            let multiplier = f64::from(target.1) / f64::from(swapchain.1.max(1));
            aspect_close && (MIN_MULTIPLIER..=MAX_MULTIPLIER).contains(&multiplier)
        }
        SwapchainMatchMode::ExtendedAspectRatio => {
            let (tw, th) = (f64::from(target.0), f64::from(target.1));
            let (sw, sh) = (f64::from(swapchain.0.max(1)), f64::from(swapchain.1.max(1)));
            let downscaled = near_integer(sw / tw).zip(near_integer(sh / th));
            let upscaled = near_integer(tw / sw).zip(near_integer(th / sh));
            let integer_scale = [downscaled, upscaled]
                .into_iter()
                .flatten()
                .any(|(x, y)| x == y);
            integer_scale || aspect_close
        }
    }
}

/// Looks up resource, format and extent behind `view`.
pub fn describe_view(device: &dyn Device, view: ResourceViewHandle) -> Result<ResolvedView, ResolveFailure> {
    if view.is_null() {
        return Err(ResolveFailure::NothingBound);
    }
    let resource = device.view_resource(view)?;
    let desc = device.resource_desc(resource)?;
    let format = device.view_desc(view).map(|desc| desc.format).unwrap_or(desc.format);
    Ok(ResolvedView {
        view,
        resource,
        format: if format == Format::Unknown { desc.format } else { format },
        extent: desc.extent(),
    })
}

/// Resolves the configured render target out of the currently bound ones and
/// applies the swapchain match policy. `describe` receives the clamped slot
/// and the view bound there.
pub fn resolve_render_target(
    targets: &[ResourceViewHandle],
    index: u32,
    mode: SwapchainMatchMode,
    swapchain: (u32, u32),
    describe: impl FnOnce(usize, ResourceViewHandle) -> Result<ResolvedView, ResolveFailure>,
) -> Result<ResolvedView, ResolveFailure> {
    let slot = resolve_index(index, targets.len()).ok_or(ResolveFailure::NothingBound)?;
    let resolved = describe(slot, targets[slot])?;
    check_swapchain(resolved, mode, swapchain)
}

pub fn check_swapchain(
    resolved: ResolvedView,
    mode: SwapchainMatchMode,
    swapchain: (u32, u32),
) -> Result<ResolvedView, ResolveFailure> {
    if matches_swapchain(mode, resolved.extent, swapchain) {
        Ok(resolved)
    } else {
        Err(ResolveFailure::SwapchainMismatch {
            target: resolved.extent,
            swapchain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipestate::recording::MemoryDevice;
    use pipestate::{ResourceDesc, ResourceUsage, ResourceViewDesc};

    #[test]
    fn index_is_clamped_to_the_last_entry() {
        assert_eq!(resolve_index(0, 0), None);
        assert_eq!(resolve_index(5, 0), None);
        assert_eq!(resolve_index(0, 2), Some(0));
        assert_eq!(resolve_index(1, 2), Some(1));
        assert_eq!(resolve_index(7, 2), Some(1));
    }

    #[test]
    fn cycling_skips_invalid_entries_and_clamps() {
        let valid = [true, false, false, true, false];
        let is_valid = |index: usize| valid[index];
        assert_eq!(cycle_index(0, valid.len(), CycleDirection::Up, is_valid), 3);
        assert_eq!(cycle_index(3, valid.len(), CycleDirection::Up, is_valid), 3);
        assert_eq!(cycle_index(3, valid.len(), CycleDirection::Down, is_valid), 0);
        assert_eq!(cycle_index(0, valid.len(), CycleDirection::Down, is_valid), 0);
        assert_eq!(cycle_index(9, valid.len(), CycleDirection::Down, is_valid), 3);
        assert_eq!(cycle_index(9, valid.len(), CycleDirection::Up, is_valid), 4);
        assert_eq!(cycle_index(2, 0, CycleDirection::Up, |_| true), 0);
    }

    #[test]
    fn resolution_mode_requires_exact_size() {
        let mode = SwapchainMatchMode::Resolution;
        assert!(matches_swapchain(mode, (1920, 1080), (1920, 1080)));
        assert!(!matches_swapchain(mode, (1920, 1080), (2560, 1440)));
    }

    #[test]
    fn aspect_ratio_mode_clamps_the_multiplier() {
        let mode = SwapchainMatchMode::AspectRatio;
        assert!(matches_swapchain(mode, (1920, 1080), (2560, 1440)));
        assert!(matches_swapchain(mode, (960, 540), (1920, 1080)));
        assert!(!matches_swapchain(mode, (480, 270), (1920, 1080)));
        assert!(!matches_swapchain(mode, (3840, 2160), (1920, 1080)));
        assert!(!matches_swapchain(mode, (512, 512), (1920, 1080)));
    }

    #[test]
    fn extended_mode_accepts_integer_scales() {
        let mode = SwapchainMatchMode::ExtendedAspectRatio;
        assert!(matches_swapchain(mode, (480, 270), (1920, 1080)));
        assert!(matches_swapchain(mode, (3840, 2160), (1920, 1080)));
        assert!(matches_swapchain(mode, (640, 360), (1920, 1080)));
        assert!(!matches_swapchain(mode, (512, 512), (1920, 1080)));
        assert!(matches_swapchain(SwapchainMatchMode::None, (512, 512), (1920, 1080)));
    }

    #[test]
    fn render_targets_resolve_through_the_device() {
        let device = MemoryDevice::new();
        let texture = device
            .create_resource(
                &ResourceDesc::texture_2d(1920, 1080, Format::R8G8B8A8Typeless, ResourceUsage::RENDER_TARGET),
                None,
            )
            .unwrap();
        let view = device
            .create_resource_view(
                texture,
                ResourceUsage::RENDER_TARGET,
                &ResourceViewDesc {
                    format: Format::R8G8B8A8UnormSrgb,
                },
            )
            .unwrap();

        let describe = |_, view| describe_view(&device, view);
        let resolved = resolve_render_target(
            &[view, ResourceViewHandle::NULL],
            0,
            SwapchainMatchMode::Resolution,
            (1920, 1080),
            describe,
        )
        .unwrap();
        assert_eq!(resolved.resource, texture);
        assert_eq!(resolved.format, Format::R8G8B8A8UnormSrgb);

        assert!(matches!(
            resolve_render_target(&[view, ResourceViewHandle::NULL], 1, SwapchainMatchMode::None, (1920, 1080), describe),
            Err(ResolveFailure::NothingBound)
        ));
        assert!(matches!(
            resolve_render_target(&[], 0, SwapchainMatchMode::None, (1920, 1080), describe),
            Err(ResolveFailure::NothingBound)
        ));
        assert!(matches!(
            resolve_render_target(&[view], 0, SwapchainMatchMode::Resolution, (2560, 1440), describe),
            Err(ResolveFailure::SwapchainMismatch { .. })
        ));

        let mut slots = Vec::new();
        let clamped = resolve_render_target(&[view], 6, SwapchainMatchMode::None, (1920, 1080), |slot, view| {
            slots.push(slot);
            describe_view(&device, view)
        });
        assert_eq!(clamped.unwrap().view, view);
        assert_eq!(slots, vec![0]);
    }
}
