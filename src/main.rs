//! openpl-cli: drive a demonstration room simulation from the command line
//!
//! Builds a cubic room with a single box obstacle, voxelises it, runs the
//! acoustic FDTD kernel and prints the impulse response captured at a
//! listener on the far side of the obstacle.

use anyhow::{Context, Result};
use clap::Parser;
use openpl::fdtd::{sampling_rate, spatial_step};
use openpl::{Quat, SimulationConfig, System, Vec3};

/// Unit cube corner positions, scaled by the obstacle size at ingestion.
const CUBE_VERTICES: [f64; 24] = [
    -0.5, -0.5, -0.5, //
    0.5, -0.5, -0.5, //
    0.5, 0.5, -0.5, //
    -0.5, 0.5, -0.5, //
    -0.5, -0.5, 0.5, //
    0.5, -0.5, 0.5, //
    0.5, 0.5, 0.5, //
    -0.5, 0.5, 0.5, //
];

/// Unit cube triangle list, counter-clockwise viewed from outside.
const CUBE_INDICES: [u32; 36] = [
    0, 2, 1, 0, 3, 2, //
    4, 5, 6, 4, 6, 7, //
    0, 1, 5, 0, 5, 4, //
    3, 7, 6, 3, 6, 2, //
    0, 4, 7, 0, 7, 3, //
    1, 2, 6, 1, 6, 5, //
];

#[derive(Parser, Debug)]
#[command(name = "openpl-cli")]
#[command(about = "Voxelise a demo room and capture its acoustic impulse response")]
#[command(version)]
struct Args {
    /// Room edge length in metres
    #[arg(long, default_value = "6.0")]
    room: f64,

    /// Obstacle edge length in metres
    #[arg(long, default_value = "1.2")]
    obstacle: f64,

    /// Simulation length in time steps
    #[arg(long, default_value = "60")]
    steps: usize,

    /// Wall absorption coefficient of the obstacle
    #[arg(long, default_value = "0.75")]
    absorption: f64,

    /// Print the impulse response as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut system = System::new();
    let scene = system.create_scene();

    scene
        .add_mesh(
            Vec3::zeros(),
            Quat::identity(),
            Vec3::repeat(args.obstacle),
            &CUBE_VERTICES,
            &CUBE_INDICES,
            args.absorption,
        )
        .context("obstacle mesh rejected")?;

    let source = Vec3::new(-args.room / 4.0, 0.0, 0.0);
    let listener = Vec3::new(args.room / 4.0, 0.0, 0.0);
    scene.add_source_location(source).context("source rejected")?;
    scene.add_listener_location(listener).context("listener rejected")?;

    scene.set_config(SimulationConfig {
        steps: args.steps,
        ..SimulationConfig::default()
    });

    scene
        .voxelise(Vec3::zeros(), Vec3::repeat(args.room), spatial_step())
        .context("voxelisation rejected")?;
    scene.simulate().context("simulation failed")?;

    let cells = scene.voxel_count().context("voxel query failed")?;
    let response = scene.impulse_response(0).context("no impulse response")?;
    let peak = response.iter().fold(0.0f64, |acc, p| acc.max(p.abs()));

    if args.json {
        let payload = serde_json::json!({
            "cells": cells,
            "steps": args.steps,
            "sampling_rate_hz": sampling_rate(),
            "impulse_response": response,
        });
        println!("{payload}");
    } else {
        println!("room: {:.1} m, obstacle: {:.1} m", args.room, args.obstacle);
        println!("lattice: {cells} cells at {:.4} m", spatial_step());
        println!(
            "response: {} samples at {:.1} Hz, peak |p| = {peak:.6}",
            response.len(),
            sampling_rate()
        );
    }

    Ok(())
}
