mod args;
mod calypso;
mod compal;
mod event;
mod image;
mod link;
mod loader;
mod orchestrator;
mod serial;
mod tools;

use crate::args::Args;
use clap::CommandFactory;
use clap::Parser;
use std::process::exit;

use color_eyre::eyre;
use stderrlog::Timestamp;

fn bin_name() -> &'static str {
    option_env!("CARGO_BIN_NAME").unwrap_or("calcon")
}

fn usage() -> ! {
    let _ = <Args as CommandFactory>::command().print_help();
    exit(2);
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    if args.version {
        println!("{} version {}", bin_name(), env!("CARGO_PKG_VERSION"));
        exit(2);
    }
    if args.help {
        usage();
    }

    stderrlog::new()
        .module(module_path!())
        .quiet(args.quiet)
        .verbosity(2 + args.debug as usize)
        .timestamp(if args.timestamps {
            Timestamp::Microsecond
        } else {
            Timestamp::Off
        })
        .init()
        .unwrap();

    let Some(image) = args.image.clone() else {
        eprintln!("you have to specify the filename");
        usage();
    };
    match std::fs::metadata(&image) {
        Ok(meta) if meta.len() as usize > image::MAX_IMAGE_SIZE => {
            log::error!(
                "{} is {} bytes, the maximum file size is 64kBytes ({} bytes)",
                image.display(),
                meta.len(),
                image::MAX_IMAGE_SIZE
            );
            exit(2);
        }
        Ok(meta) if !meta.is_file() => {
            log::error!("{} is not a file, exiting", image.display());
            exit(1);
        }
        Ok(_) => {}
        Err(e) => {
            log::error!("{}: {e}, exiting", image.display());
            exit(1);
        }
    }

    let mut orchestrator = match orchestrator::Orchestrator::new(&args, image) {
        Ok(o) => o,
        Err(e) => {
            log::error!("initialization failed: {e:#}");
            exit(1);
        }
    };
    // runs until serial EOF (exit 2) or a hard I/O error
    orchestrator.run()
}
