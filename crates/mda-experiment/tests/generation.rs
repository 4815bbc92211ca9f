use mda_core::axis::AxisKind;
use mda_core::capabilities::ImageGeometry;
use mda_core::event::{AcquisitionEvent, StagePosition};
use mda_core::settings::{ChannelSpec, Footprint, Point3, SequenceSettings, SpaceMode, SurfaceDef};
use mda_experiment::estimate::total_images;
use mda_experiment::{AcquisitionPlan, HardwareContext};
use std::collections::BTreeMap;
use std::sync::Arc;

fn context() -> HardwareContext {
    HardwareContext::nominal(ImageGeometry {
        width: 64,
        height: 64,
        bytes_per_pixel: 2,
    })
}

fn plan(settings: SequenceSettings) -> AcquisitionPlan {
    AcquisitionPlan::build(Arc::new(settings), context()).unwrap()
}

fn events(settings: SequenceSettings) -> Vec<AcquisitionEvent> {
    plan(settings).events().collect()
}

fn index_tuple(event: &AcquisitionEvent, order: &[AxisKind]) -> Vec<i64> {
    order
        .iter()
        .map(|axis| event.axis(*axis).unwrap_or(0))
        .collect()
}

fn full_settings(time_first: bool, slices_first: bool) -> SequenceSettings {
    SequenceSettings {
        use_frames: true,
        num_frames: 3,
        use_position_list: true,
        positions: vec![
            StagePosition::new("A", 0.0, 0.0),
            StagePosition::new("B", 100.0, 0.0),
        ],
        use_channels: true,
        channels: vec![
            ChannelSpec::new("DAPI", 5.0),
            ChannelSpec {
                skip_frames: 1,
                ..ChannelSpec::new("FITC", 5.0)
            },
            ChannelSpec {
                do_z_stack: false,
                ..ChannelSpec::new("BF", 1.0)
            },
        ],
        use_slices: true,
        slice_z_bottom_um: 0.0,
        slice_z_top_um: 2.0,
        slice_z_step_um: 1.0,
        time_first,
        slices_first,
        ..Default::default()
    }
}

#[test]
fn test_event_count_matches_estimate() {
    for time_first in [false, true] {
        for slices_first in [false, true] {
            for use_frames in [false, true] {
                for use_slices in [false, true] {
                    for use_position_list in [false, true] {
                        let settings = SequenceSettings {
                            use_frames,
                            use_slices,
                            use_position_list,
                            ..full_settings(time_first, slices_first)
                        };
                        let plan = plan(settings);
                        assert_eq!(
                            plan.events().count() as u64,
                            total_images(&plan).unwrap(),
                            "frames={} slices={} positions={} time_first={} slices_first={}",
                            use_frames,
                            use_slices,
                            use_position_list,
                            time_first,
                            slices_first
                        );
                    }
                }
            }
        }
    }
}

fn square(name: &str, z: f64, size: f64) -> SurfaceDef {
    SurfaceDef {
        name: name.into(),
        points: vec![
            Point3::new(0.0, 0.0, z),
            Point3::new(size, 0.0, z),
            Point3::new(size, size, z),
            Point3::new(0.0, size, z),
        ],
    }
}

fn tilted(name: &str) -> SurfaceDef {
    SurfaceDef {
        name: name.into(),
        points: vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(200.0, 0.0, 0.0),
            Point3::new(200.0, 200.0, 20.0),
            Point3::new(0.0, 200.0, 20.0),
        ],
    }
}

/// Two frames over three channels, one skipping frames and one single-plane.
fn volume_base(mode: SpaceMode, footprint: Footprint) -> SequenceSettings {
    let mut settings = SequenceSettings {
        use_frames: true,
        num_frames: 2,
        use_channels: true,
        channels: vec![
            ChannelSpec::new("DAPI", 5.0),
            ChannelSpec {
                skip_frames: 1,
                ..ChannelSpec::new("FITC", 5.0)
            },
            ChannelSpec {
                do_z_stack: false,
                ..ChannelSpec::new("BF", 1.0)
            },
        ],
        ..Default::default()
    };
    settings.volume.mode = mode;
    settings.volume.footprint = footprint;
    settings.volume.z_step_um = 1.0;
    settings
}

fn grid(rows: usize, cols: usize, center: (f64, f64)) -> Footprint {
    Footprint::Grid {
        rows,
        cols,
        center_x_um: center.0,
        center_y_um: center.1,
    }
}

fn events_per_tile(plan: &AcquisitionPlan) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = plan
        .positions()
        .unwrap()
        .iter()
        .map(|p| (p.label.clone(), 0))
        .collect();
    for event in plan.events() {
        *counts.get_mut(&event.xy.unwrap().label).unwrap() += 1;
    }
    counts
}

#[test]
fn test_event_count_matches_estimate_for_region_modes() {
    let mut cuboid = volume_base(SpaceMode::Cuboid, grid(2, 2, (0.0, 0.0)));
    cuboid.volume.cuboid_z_start_um = 0.0;
    cuboid.volume.cuboid_z_end_um = 4.0;

    let mut fixed = volume_base(
        SpaceMode::FixedDistanceFromSurface,
        Footprint::Surface {
            name: "tilt".into(),
        },
    );
    fixed.volume.fixed_surface = Some("tilt".into());
    fixed.volume.distance_above_surface_um = 2.0;
    fixed.volume.distance_below_surface_um = 3.0;
    fixed.volume.surfaces.push(tilted("tilt"));

    let mut between = volume_base(SpaceMode::VolumeBetweenSurfaces, grid(3, 3, (50.0, 50.0)));
    between.volume.top_surface = Some("top".into());
    between.volume.bottom_surface = Some("bottom".into());
    between.volume.distance_above_top_um = 1.0;
    between.volume.surfaces.push(square("top", 5.0, 100.0));
    between.volume.surfaces.push(square("bottom", 9.0, 100.0));

    let mut guided = volume_base(SpaceMode::Region2DSurfaceGuided, grid(2, 3, (0.0, 0.0)));
    guided.volume.collection_plane = Some("tilt".into());
    guided.volume.surfaces.push(tilted("tilt"));

    let region = volume_base(SpaceMode::Region2D, grid(2, 2, (0.0, 0.0)));

    for (label, settings) in [
        ("cuboid", cuboid),
        ("fixed distance", fixed),
        ("between surfaces", between),
        ("surface guided", guided),
        ("region", region),
    ] {
        for slices_first in [false, true] {
            let plan = plan(SequenceSettings {
                slices_first,
                ..settings.clone()
            });
            assert!(plan.positions().unwrap().len() > 1, "{} is tiled", label);
            let generated = plan.events().count() as u64;
            assert!(generated > 0, "{}", label);
            assert_eq!(
                generated,
                total_images(&plan).unwrap(),
                "{} slices_first={}",
                label,
                slices_first
            );
        }
    }
}

#[test]
fn test_tiles_outside_both_surfaces_contribute_nothing() {
    let mut settings = volume_base(SpaceMode::VolumeBetweenSurfaces, grid(1, 3, (150.0, 50.0)));
    settings.volume.top_surface = Some("top".into());
    settings.volume.bottom_surface = Some("bottom".into());
    settings.volume.surfaces.push(square("top", 5.0, 100.0));
    settings.volume.surfaces.push(square("bottom", 9.0, 100.0));

    for slices_first in [false, true] {
        let plan = plan(SequenceSettings {
            slices_first,
            ..settings.clone()
        });
        // only the first tile reaches over the surfaces
        let per_tile = events_per_tile(&plan);
        let expected: BTreeMap<String, usize> = [
            ("Grid_0_0".to_string(), 17),
            ("Grid_0_1".to_string(), 0),
            ("Grid_0_2".to_string(), 0),
        ]
        .into_iter()
        .collect();
        assert_eq!(per_tile, expected, "slices_first={}", slices_first);
        assert_eq!(total_images(&plan).unwrap(), 17);
    }
}

#[test]
fn test_events_follow_nesting_order() {
    for time_first in [false, true] {
        for slices_first in [false, true] {
            let plan = plan(full_settings(time_first, slices_first));
            let order = plan.axis_order();
            assert_eq!(order.len(), 4);
            assert_eq!(
                order[3] == AxisKind::Slice,
                slices_first,
                "slice axis innermost iff slices_first"
            );

            let tuples: Vec<Vec<i64>> = plan
                .events()
                .map(|e| index_tuple(&e, &order))
                .collect();
            for pair in tuples.windows(2) {
                assert!(pair[0] < pair[1], "{:?} !< {:?} in {:?}", pair[0], pair[1], order);
            }
        }
    }
}

#[test]
fn test_regenerating_yields_identical_events() {
    let plan = plan(full_settings(false, true));
    let first: Vec<_> = plan.events().collect();
    let second: Vec<_> = plan.events().collect();
    assert_eq!(first, second);
}

#[test]
fn test_skip_factor_selects_frames() {
    let settings = SequenceSettings {
        use_frames: true,
        num_frames: 7,
        use_channels: true,
        channels: vec![ChannelSpec {
            skip_frames: 2,
            ..ChannelSpec::new("Cy5", 10.0)
        }],
        ..Default::default()
    };
    let frames: Vec<i64> = events(settings).iter().map(AcquisitionEvent::frame).collect();
    assert_eq!(frames, vec![0, 3, 6]);
}

#[test]
fn test_two_frames_two_channels_one_skipping() {
    let settings = SequenceSettings {
        use_frames: true,
        num_frames: 2,
        use_channels: true,
        channels: vec![
            ChannelSpec::new("DAPI", 10.0),
            ChannelSpec {
                skip_frames: 1,
                ..ChannelSpec::new("FITC", 10.0)
            },
        ],
        ..Default::default()
    };
    let events = events(settings);
    let seen: Vec<(i64, String)> = events
        .iter()
        .map(|e| {
            let channel = e.channel.as_ref().map(|c| c.config.clone()).unwrap_or_default();
            (e.frame(), channel)
        })
        .collect();
    assert_eq!(
        seen,
        vec![
            (0, "DAPI".to_string()),
            (0, "FITC".to_string()),
            (1, "DAPI".to_string()),
        ]
    );
}

#[test]
fn test_bounded_stack_includes_both_ends() {
    let settings = SequenceSettings {
        use_slices: true,
        slice_z_bottom_um: 0.0,
        slice_z_top_um: 5.0,
        slice_z_step_um: 5.0,
        ..Default::default()
    };
    let z: Vec<Option<f64>> = events(settings).iter().map(|e| e.z_um).collect();
    assert_eq!(z, vec![Some(0.0), Some(5.0)]);
}

#[test]
fn test_single_plane_channel_takes_first_slice_only() {
    for slices_first in [false, true] {
        let settings = SequenceSettings {
            use_channels: true,
            channels: vec![
                ChannelSpec::new("DAPI", 10.0),
                ChannelSpec {
                    do_z_stack: false,
                    ..ChannelSpec::new("BF", 1.0)
                },
            ],
            use_slices: true,
            slice_z_bottom_um: 0.0,
            slice_z_top_um: 3.0,
            slices_first,
            ..Default::default()
        };
        let bf: Vec<Option<f64>> = events(settings)
            .iter()
            .filter(|e| e.channel.as_ref().is_some_and(|c| c.config == "BF"))
            .map(|e| e.z_um)
            .collect();
        assert_eq!(bf, vec![Some(0.0)], "slices_first={}", slices_first);
    }
}

#[test]
fn test_fixed_distance_margins_around_surface() {
    let mut settings = SequenceSettings::default();
    settings.volume.mode = SpaceMode::FixedDistanceFromSurface;
    settings.volume.fixed_surface = Some("tissue".into());
    settings.volume.distance_above_surface_um = 2.0;
    settings.volume.distance_below_surface_um = 3.0;
    settings.volume.z_step_um = 1.0;
    settings.volume.footprint = Footprint::CurrentPosition;
    settings.volume.surfaces.push(SurfaceDef {
        name: "tissue".into(),
        points: vec![
            Point3::new(0.0, 0.0, 10.0),
            Point3::new(1000.0, 0.0, 10.0),
            Point3::new(1000.0, 1000.0, 10.0),
            Point3::new(0.0, 1000.0, 10.0),
        ],
    });

    let mut ctx = context();
    ctx.xy_reference_um = (500.0, 500.0);
    let plan = AcquisitionPlan::build(Arc::new(settings), ctx).unwrap();
    let z: Vec<f64> = plan.events().filter_map(|e| e.z_um).collect();
    assert_eq!(z, vec![8.0, 9.0, 10.0, 11.0, 12.0, 13.0]);
    assert_eq!(plan.calculate_slices(), z);
}

#[test]
fn test_invalid_settings_rejected_before_generation() {
    let settings = SequenceSettings {
        use_slices: true,
        slice_z_bottom_um: 0.0,
        slice_z_top_um: 5.0,
        slice_z_step_um: 0.0,
        ..Default::default()
    };
    assert!(AcquisitionPlan::build(Arc::new(settings), context()).is_err());

    let mut settings = SequenceSettings::default();
    settings.volume.mode = SpaceMode::FixedDistanceFromSurface;
    settings.volume.fixed_surface = Some("missing".into());
    assert!(AcquisitionPlan::build(Arc::new(settings), context()).is_err());
}
