use std::{
    collections::BTreeMap,
    error::Error,
    fs,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use framedb::{inspect_image, FrameHeader, FrameId, FrameKind, RecordHeader, DEFAULT_FRAME_SIZE_BYTES};

#[derive(Parser)]
#[command(name = "framedb-cli", version, about = "Inspect framedb frame files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the decoded header and row headers of one or every frame
    Inspect {
        file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_FRAME_SIZE_BYTES)]
        frame_size: usize,
        /// Byte offset of a single frame to print
        #[arg(long)]
        frame: Option<i64>,
    },
    /// Per-kind frame counts and fill ratios
    Stats {
        file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_FRAME_SIZE_BYTES)]
        frame_size: usize,
    },
}

/// `<file_id>.frames` names the file id; anything else is reported as -1.
fn file_id_of(path: &Path) -> i32 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(-1)
}

type Decoded = Result<(FrameHeader, Vec<RecordHeader>), framedb::FrameError>;

fn frames(path: &Path, frame_size: usize) -> Result<Vec<(FrameId, Option<Decoded>)>, Box<dyn Error>> {
    if frame_size == 0 {
        return Err("frame size must be positive".into());
    }
    let bytes = fs::read(path)?;
    let file_id = file_id_of(path);
    let mut out = Vec::new();
    for (i, page) in bytes.chunks(frame_size).enumerate() {
        let id = FrameId::new(file_id, (i * frame_size) as i64);
        if page.iter().all(|b| *b == 0) {
            out.push((id, None));
        } else {
            out.push((id, Some(inspect_image(page, id))));
        }
    }
    Ok(out)
}

fn link(file_id: i32, pointer: i64) -> String {
    if file_id < 0 || pointer < 0 {
        "-".to_string()
    } else {
        FrameId::new(file_id, pointer).to_string()
    }
}

fn print_frame(id: FrameId, decoded: Option<Decoded>) {
    let (header, rows) = match decoded {
        None => {
            println!("frame {id}: unformatted");
            return;
        }
        Some(Err(e)) => {
            println!("frame {id}: {e}");
            return;
        }
        Some(Ok(decoded)) => decoded,
    };
    println!(
        "frame {id}: {:?} object={} rows={} rowCounter={} bytesUsed={}",
        header.kind,
        header.object_id,
        rows.len(),
        header.row_counter,
        header.bytes_used
    );
    let ints = &header.int_slots;
    let longs = &header.long_slots;
    match header.kind {
        FrameKind::Heap => println!(
            "  prev={} next={}",
            link(ints[0], longs[0]),
            link(ints[1], longs[1])
        ),
        FrameKind::IndexNode | FrameKind::IndexLeaf => {
            let next = ((ints[2] as i64) << 32) | (ints[3] as u32 as i64);
            println!(
                "  flags={:#05b} parent={} next={} leftChild={}",
                ints[0],
                link(ints[1], longs[0]),
                link(ints[4], next),
                link(id.file_id, longs[1])
            );
        }
    }
    for row in rows {
        let back = row
            .back_pointer
            .map(|a| format!(" -> {a}"))
            .unwrap_or_default();
        println!(
            "  ptr={:<5} owner={:<6} state={:?} len={}{back}",
            row.in_page_ptr, row.owner_tx, row.state, row.length
        );
    }
}

#[derive(Default)]
struct KindStats {
    frames: usize,
    rows: usize,
    used: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    match Cli::parse().command {
        Command::Inspect {
            file,
            frame_size,
            frame,
        } => {
            for (id, decoded) in frames(&file, frame_size)? {
                if frame.map_or(true, |p| p == id.frame_pointer) {
                    print_frame(id, decoded);
                }
            }
        }
        Command::Stats { file, frame_size } => {
            let mut stats: BTreeMap<String, KindStats> = BTreeMap::new();
            for (_, decoded) in frames(&file, frame_size)? {
                let (label, rows, used) = match decoded {
                    None => ("Unformatted".to_string(), 0, 0),
                    Some(Err(_)) => ("Invalid".to_string(), 0, 0),
                    Some(Ok((header, rows))) => {
                        (format!("{:?}", header.kind), rows.len(), header.bytes_used as u64)
                    }
                };
                let entry = stats.entry(label).or_default();
                entry.frames += 1;
                entry.rows += rows;
                entry.used += used;
            }
            println!("{:<12} {:>8} {:>8} {:>6}", "kind", "frames", "rows", "fill");
            for (label, s) in &stats {
                let fill = s.used as f64 / (s.frames * frame_size) as f64;
                println!(
                    "{label:<12} {:>8} {:>8} {:>5.1}%",
                    s.frames,
                    s.rows,
                    fill * 100.0
                );
            }
        }
    }
    Ok(())
}
