use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use csv::Writer;
use serde::Serialize;

use crate::error::Error;
use crate::Object;

/// One CSV row. Payloads are base64 so binary blobs survive the trip.
#[derive(Debug, Serialize)]
struct Record {
    key: String,
    size: u32,
    revs: u32,
    value_base64: String,
}

/// Serialize a listing to a CSV file at `output_path`.
pub fn write_csv<P: AsRef<Path>>(objects: &[Object], output_path: P) -> Result<(), Error> {
    let mut wtr = Writer::from_path(output_path)?;
    write_records(&mut wtr, objects)
}

/// Serialize a listing to CSV and return it as a `String`.
pub fn write_csv_content(objects: &[Object]) -> Result<String, Error> {
    let mut wtr = Writer::from_writer(Vec::new());
    write_records(&mut wtr, objects)?;
    let bytes = wtr.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    Ok(String::from_utf8(bytes).expect("CSV output is UTF-8 by construction"))
}

fn write_records<W: std::io::Write>(wtr: &mut Writer<W>, objects: &[Object]) -> Result<(), Error> {
    for object in objects {
        wtr.serialize(Record {
            key: object.printable_key(),
            size: object.size,
            revs: object.revs,
            value_base64: STANDARD.encode(&object.value),
        })?;
    }
    wtr.flush()?;
    Ok(())
}
