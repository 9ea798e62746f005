use anyhow::{bail, Context, Result};
use clap::Parser;
use emu_core::logging::{LogCategory, LogConfig, LogLevel};
use emu_core::types::Frame;
use emu_core::System;
use emu_tx81z::config::MachineConfig;
use emu_tx81z::rom::{RomError, RomSet};
use emu_tx81z::{Tx81zSystem, MOUNT_BIOS, MOUNT_CHARACTER_ROM};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

mod screenshot;
mod settings;

use settings::Settings;

#[derive(Parser)]
#[command(name = "tx81z", about = "Headless Yamaha TX81Z emulator")]
struct Args {
    /// `;`-separated directories searched for ROM images
    #[arg(long)]
    rompath: Option<String>,

    /// Firmware revision to boot (see --list-bios)
    #[arg(long)]
    bios: Option<String>,

    /// List the known firmware revisions and exit
    #[arg(long, default_value_t = false)]
    list_bios: bool,

    /// Check every known firmware image on the rompath and exit
    #[arg(long, default_value_t = false)]
    verify_roms: bool,

    /// Refuse to boot an image whose checksums do not match
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Number of frames to run
    #[arg(long, default_value_t = 60)]
    frames: u32,

    /// Directory holding the battery-backed RAM image
    #[arg(long)]
    nvram_dir: Option<String>,

    /// Dump save-state to this file as JSON
    #[arg(long)]
    save: Option<String>,

    /// Restore a save-state before running
    #[arg(long)]
    load: Option<String>,

    /// Write the final frame as PNG
    #[arg(long)]
    screenshot: Option<String>,

    /// Raw MIDI bytes fed to MIDI IN at power-up
    #[arg(long)]
    midi_in: Option<String>,

    /// Write every byte sent on MIDI OUT to this file
    #[arg(long)]
    midi_out: Option<String>,

    /// Print the panel text after the last frame
    #[arg(long, default_value_t = false)]
    print_lcd: bool,

    /// Print debug_state after the last frame
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Settings file (defaults to tx81z.json next to the executable)
    #[arg(long)]
    config: Option<String>,

    /// Store --rompath, --bios, --strict and --nvram-dir in the settings file
    #[arg(long, default_value_t = false)]
    save_config: bool,

    /// Level for every emulator log category (off, error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    log_cpu: Option<String>,

    #[arg(long)]
    log_bus: Option<String>,

    #[arg(long)]
    log_video: Option<String>,

    #[arg(long)]
    log_sound: Option<String>,

    #[arg(long)]
    log_serial: Option<String>,

    #[arg(long)]
    log_interrupts: Option<String>,

    #[arg(long)]
    log_stubs: Option<String>,

    /// Send emulator logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<String>,
}

fn parse_level(value: &str) -> Result<LogLevel> {
    match LogLevel::from_str(value) {
        Some(level) => Ok(level),
        None => bail!("Invalid log level: {}", value),
    }
}

fn configure_logging(args: &Args, settings: &Settings) -> Result<()> {
    let config = LogConfig::global();

    if let Some(level) = args.log_level.as_ref().or(settings.log_level.as_ref()) {
        config.set_global_level(parse_level(level)?);
    }

    let per_category = [
        (LogCategory::CPU, &args.log_cpu),
        (LogCategory::Bus, &args.log_bus),
        (LogCategory::Video, &args.log_video),
        (LogCategory::Sound, &args.log_sound),
        (LogCategory::Serial, &args.log_serial),
        (LogCategory::Interrupts, &args.log_interrupts),
        (LogCategory::Stubs, &args.log_stubs),
    ];
    for (category, level) in per_category {
        if let Some(level) = level {
            config.set_level(category, parse_level(level)?);
        }
    }

    if let Some(path) = args.log_file.as_ref().or(settings.log_file.as_ref()) {
        config
            .set_log_file(PathBuf::from(path))
            .with_context(|| format!("Cannot open log file {}", path))?;
    }
    Ok(())
}

fn list_bios(romset: &RomSet) {
    println!("Known TX81Z firmware revisions:");
    for (i, variant) in romset.variants().iter().enumerate() {
        println!(
            "  {:<5} {:<40} {}{}",
            variant.name,
            variant.description,
            variant.file,
            if i == 0 { "  (default)" } else { "" }
        );
    }
}

fn verify_roms(romset: &RomSet, rompath: &str) -> Result<()> {
    let mut found = 0;
    for variant in romset.variants() {
        match romset.load(rompath, variant, true) {
            Ok(rom) => {
                found += 1;
                println!("{:<5} OK        {}", variant.name, rom.path.display());
            }
            Err(RomError::NotFound { .. }) => println!("{:<5} missing", variant.name),
            Err(e) => println!("{:<5} BAD       {}", variant.name, e),
        }
    }
    if found == 0 {
        bail!("No usable TX81Z firmware found on rompath '{}'", rompath);
    }
    Ok(())
}

fn nvram_path(dir: &str) -> PathBuf {
    Path::new(dir).join("tx81z.nv")
}

/// Restore a save state; the NVRAM it carries replaces the on-disk image at exit
fn restore_state(sys: &mut Tx81zSystem, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    let state: serde_json::Value = serde_json::from_str(&text)?;
    sys.load_state(&state)
        .with_context(|| format!("Cannot restore {}", path.display()))?;
    sys.nvram_mut().mark_dirty();
    Ok(())
}

fn print_lcd(lines: &[String]) {
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    println!("+{}+", "-".repeat(width));
    for line in lines {
        println!("|{}|", line);
    }
    println!("+{}+", "-".repeat(width));
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config_path = args
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(Settings::config_path);
    let mut settings = Settings::load_from(&config_path);
    configure_logging(&args, &settings)?;

    if args.save_config {
        if args.rompath.is_some() {
            settings.rompath = args.rompath.clone();
        }
        if args.bios.is_some() {
            settings.bios = args.bios.clone();
        }
        if args.nvram_dir.is_some() {
            settings.nvram_dir = args.nvram_dir.clone();
        }
        settings.strict |= args.strict;
        settings
            .save_to(&config_path)
            .map_err(|e| anyhow::anyhow!("Cannot write {}: {}", config_path.display(), e))?;
        log::info!("Saved settings to {}", config_path.display());
    }

    let romset = RomSet::tx81z();
    if args.list_bios {
        list_bios(&romset);
        return Ok(());
    }

    let rompath = args
        .rompath
        .clone()
        .or_else(|| settings.rompath.clone())
        .unwrap_or_else(|| "roms".to_string());

    if args.verify_roms {
        return verify_roms(&romset, &rompath);
    }

    let variant = match args.bios.as_ref().or(settings.bios.as_ref()) {
        Some(name) => romset.select(name)?,
        None => match romset.default_variant() {
            Some(variant) => variant,
            None => bail!("No firmware revisions declared"),
        },
    };
    let strict = args.strict || settings.strict;
    let rom = romset.load(&rompath, variant, strict)?;
    log::info!(
        "Loaded '{}' from {}{}",
        variant.name,
        rom.path.display(),
        if rom.verified { "" } else { " (checksum mismatch)" }
    );

    let mut sys = Tx81zSystem::new(MachineConfig::tx81z())?;
    sys.mount(MOUNT_BIOS, &rom.data)?;

    if let Some(path) = &settings.character_rom {
        let data =
            std::fs::read(path).with_context(|| format!("Cannot read character ROM {}", path))?;
        sys.mount(MOUNT_CHARACTER_ROM, &data)?;
    }

    let nvram_file = args
        .nvram_dir
        .as_ref()
        .or(settings.nvram_dir.as_ref())
        .map(|dir| nvram_path(dir));
    if let Some(path) = &nvram_file {
        sys.nvram_mut().load_from_path(path)?;
    }

    if let Some(path) = &args.load {
        restore_state(&mut sys, Path::new(path))?;
    }

    if let Some(path) = &args.midi_in {
        let bytes = std::fs::read(path).with_context(|| format!("Cannot read {}", path))?;
        log::info!("Queued {} MIDI bytes from {}", bytes.len(), path);
        sys.midi_in(&bytes);
    }

    let mut midi_out = Vec::new();
    let mut last_frame: Option<Frame> = None;
    for _ in 0..args.frames {
        last_frame = Some(sys.step_frame()?);
        midi_out.extend(sys.take_midi_out());
    }
    log::info!("Ran {} frames", args.frames);

    if args.print_lcd {
        print_lcd(&sys.lcd_text());
    }

    if args.debug {
        println!("{}", serde_json::to_string_pretty(&sys.debug_state())?);
    }

    if let Some(path) = &args.midi_out {
        File::create(path)?.write_all(&midi_out)?;
        log::info!("Wrote {} MIDI bytes to {}", midi_out.len(), path);
    }

    if let Some(path) = &args.screenshot {
        match &last_frame {
            Some(frame) => screenshot::write_png(frame, Path::new(path), screenshot::SCALE)?,
            None => log::warn!("No frame was produced, skipping screenshot"),
        }
    }

    if let Some(path) = &args.save {
        let state = sys.save_state();
        let mut f = File::create(path)?;
        write!(f, "{}", serde_json::to_string_pretty(&state)?)?;
    }

    if let Some(path) = &nvram_file {
        if sys.nvram().is_dirty() {
            sys.nvram_mut().save_to_path(path)?;
            log::info!("Saved NVRAM to {}", path.display());
        }
    }

    Ok(())
}
