use clap::*;
use clap_num::maybe_hex;
use log::{debug, error, info, LevelFilter};
use std::io::{Read, Seek, SeekFrom};
use vhdx_body::vhdx::{
    FileAccess, EXTENDED_PARAMETER_KEY_BLOCK_SIZE, EXTENDED_PARAMETER_KEY_LOGICAL_SECTOR_SIZE,
    EXTENDED_PARAMETER_KEY_PHYSICAL_SECTOR_SIZE,
};
use vhdx_body::{VirtualDisk, VirtualDiskParameters};

fn fail(message: String) -> ! {
    error!("{}", message);
    std::process::exit(1);
}

fn open_disk(file_path: &str, format: &str) -> VirtualDisk {
    info!("Processing the file '{}' in '{}' format...", file_path, format);
    let disk = VirtualDisk::open(file_path, format, FileAccess::Read)
        .unwrap_or_else(|err| fail(format!("Cannot open '{}': {}", file_path, err)));
    info!("------------------------------------------------------------");
    info!("Selected format: {}", disk.format_tag());
    info!("Description: {}", disk.description());
    info!("Capacity: {} bytes", disk.capacity());
    info!("Sector size: {:?}", disk.get_sector_size());
    debug!("------------------------------------------------------------");
    disk
}

fn process_file(file_path: &str, format: &str, size: u64, offset: u64) {
    let mut reader = open_disk(file_path, format);
    reader.print_info();

    if let Err(err) = reader.seek(SeekFrom::Start(offset)) {
        fail(format!("Cannot seek to {:#x}: {}", offset, err));
    }
    let mut bytes = Vec::with_capacity(size as usize);
    if let Err(err) = (&mut reader).take(size).read_to_end(&mut bytes) {
        fail(format!("Read failed: {}", err));
    }
    if (bytes.len() as u64) < size {
        debug!("Short read: {} of {} bytes", bytes.len(), size);
    }
    let result = String::from_utf8_lossy(&bytes);
    println!("{}", result);
}

fn print_info(file_path: &str, format: &str) {
    let disk = open_disk(file_path, format);
    let rendered = match disk.info() {
        Some(info) => serde_json::to_string_pretty(&info),
        None => serde_json::to_string_pretty(&disk.parameters()),
    };
    match rendered {
        Ok(json) => println!("{}", json),
        Err(err) => fail(format!("Cannot render disk information: {}", err)),
    }
}

fn create_file(file_path: &str, format: &str, variant: &str, parameters: VirtualDiskParameters) {
    let format = if format == "auto" { "vhdx" } else { format };
    info!(
        "Creating a {} {} disk of {} bytes at '{}'...",
        variant, format, parameters.capacity, file_path
    );
    let disk = VirtualDisk::create_disk(format, variant, file_path, &parameters)
        .unwrap_or_else(|err| fail(format!("Cannot create '{}': {}", file_path, err)));
    let applied = disk.parameters();
    if let Err(err) = disk.close() {
        fail(format!("Cannot close '{}': {}", file_path, err));
    }
    match serde_json::to_string_pretty(&applied) {
        Ok(json) => println!("{}", json),
        Err(err) => fail(format!("Cannot render disk parameters: {}", err)),
    }
}

fn main() {
    let matches = Command::new("vhdx_body")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Read, inspect and create VHDX and RAW virtual disks.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the disk image."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(["auto", "vhdx", "raw"])
                .required(false)
                .help("The format of the file, either 'vhdx', 'raw' or 'auto'."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required_unless_present_any(["info", "create"])
                .help("The size (in bytes) to read."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Read at a specific offset."),
        )
        .arg(
            Arg::new("info")
                .long("info")
                .action(ArgAction::SetTrue)
                .conflicts_with("create")
                .help("Print the disk information as JSON."),
        )
        .arg(
            Arg::new("create")
                .long("create")
                .value_parser(["fixed", "dynamic"])
                .requires("capacity")
                .help("Create a new disk of the given variant."),
        )
        .arg(
            Arg::new("capacity")
                .short('c')
                .long("capacity")
                .value_parser(maybe_hex::<u64>)
                .help("Virtual size (in bytes) of the disk to create."),
        )
        .arg(
            Arg::new("block_size")
                .long("block-size")
                .value_parser(maybe_hex::<u32>)
                .requires("create")
                .help("Block size (in bytes) of the VHDX disk to create."),
        )
        .arg(
            Arg::new("physical_sector_size")
                .long("physical-sector-size")
                .value_parser(maybe_hex::<u32>)
                .requires("create")
                .help("Physical sector size, 512 or 4096."),
        )
        .arg(
            Arg::new("logical_sector_size")
                .long("logical-sector-size")
                .value_parser(maybe_hex::<u32>)
                .requires("create")
                .help("Logical sector size, 512 or 4096."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches.get_one::<String>("log_level").unwrap();
    let level_filter = match log_level_str.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let file_path = matches.get_one::<String>("body").unwrap();
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);

    if let Some(variant) = matches.get_one::<String>("create") {
        let capacity = matches.get_one::<u64>("capacity").unwrap();
        let mut parameters = VirtualDiskParameters::new(*capacity);
        for (arg, key) in [
            ("block_size", EXTENDED_PARAMETER_KEY_BLOCK_SIZE),
            ("physical_sector_size", EXTENDED_PARAMETER_KEY_PHYSICAL_SECTOR_SIZE),
            ("logical_sector_size", EXTENDED_PARAMETER_KEY_LOGICAL_SECTOR_SIZE),
        ] {
            if let Some(value) = matches.get_one::<u32>(arg) {
                parameters = parameters.with(key, value);
            }
        }
        create_file(file_path, format, variant, parameters);
    } else if matches.get_flag("info") {
        print_info(file_path, format);
    } else {
        let size = matches.get_one::<u64>("size").unwrap();
        let offset = matches.get_one::<u64>("offset").unwrap_or(&0);
        process_file(file_path, format, *size, *offset);
    }
}
