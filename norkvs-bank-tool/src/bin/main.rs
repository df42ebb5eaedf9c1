use std::path::PathBuf;

use clap::{Parser, Subcommand};
use norkvs_bank_tool::{collect_objects, csv_writer, open_images, summary};

#[derive(Parser)]
#[command(name = "norkvs-bank-tool")]
#[command(about = "Inspect norkvs bank images and export their content", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print bank state and the object listing
    Dump {
        /// Left bank image
        left: PathBuf,

        /// Right bank image (defaults to a blank bank)
        right: Option<PathBuf>,
    },
    /// Export the object listing to a CSV file
    Export {
        /// Left bank image
        left: PathBuf,

        /// Right bank image (defaults to a blank bank)
        right: Option<PathBuf>,

        /// Output CSV file path
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Dump { left, right } => {
            let kvs = open_images(&left, right.as_deref())?;
            print!("{}", summary(&kvs));

            let objects = collect_objects(&kvs)?;
            println!("Objects:          {}", objects.len());
            for object in &objects {
                println!(
                    "    {:<18} {:>6} bytes  {:>3} rev(s)",
                    object.printable_key(),
                    object.size,
                    object.revs
                );
            }
            Ok(())
        }
        Commands::Export {
            left,
            right,
            output,
        } => {
            let kvs = open_images(&left, right.as_deref())?;
            let objects = collect_objects(&kvs)?;
            csv_writer::write_csv(&objects, &output)?;
            println!(
                "Exported {} objects to {}",
                objects.len(),
                output.display()
            );
            Ok(())
        }
    }
}
