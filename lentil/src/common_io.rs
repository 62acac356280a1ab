use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not, or `stdout`
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Read every non-empty line of the input_file into memory
///
/// * `input_file` - file name--either gzipped or not
///
pub fn read_lines(input_file: &str) -> anyhow::Result<Vec<Box<str>>> {
    let buf = open_buf_reader(input_file)?;
    let mut lines = vec![];
    for x in buf.lines() {
        let x = x?;
        let x = x.trim();
        if !x.is_empty() {
            lines.push(x.to_owned().into_boxed_str());
        }
    }
    Ok(lines)
}

pub struct TsvTable {
    pub header: Vec<Box<str>>,
    pub rows: Vec<Vec<Box<str>>>,
}

impl TsvTable {
    /// position of a header column
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h.as_ref() == name)
    }
}

///
/// Read a tab-separated table whose first line is the header
///
/// * `input_file` - file name--either gzipped or not
///
pub fn read_tsv(input_file: &str) -> anyhow::Result<TsvTable> {
    let lines = read_lines(input_file)?;
    let mut lines = lines.iter();

    let split = |line: &str| -> Vec<Box<str>> {
        line.split('\t')
            .map(|x| x.trim().to_owned().into_boxed_str())
            .collect()
    };

    let header = match lines.next() {
        Some(line) => split(line),
        None => anyhow::bail!("{} has no header line", input_file),
    };

    let mut rows = vec![];
    for (i, line) in lines.enumerate() {
        let words = split(line);
        if words.len() != header.len() {
            anyhow::bail!(
                "{}: line {} has {} fields, expected {}",
                input_file,
                i + 2,
                words.len(),
                header.len()
            );
        }
        rows.push(words);
    }

    Ok(TsvTable { header, rows })
}

///
/// Write a header and tab-separated rows into the output_file
///
/// * `header` - column names
/// * `rows` - rows of displayable cells
/// * `output_file` - file name--either gzipped or not
///
pub fn write_tsv<T>(header: &[Box<str>], rows: &[Vec<T>], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    writeln!(buf, "{}", header.join("\t"))?;
    for row in rows {
        let line = row
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join("\t");
        if let Err(e) = writeln!(buf, "{}", line) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            } else {
                return Err(anyhow::anyhow!("unexpected error: {}", e));
            }
        }
    }
    buf.flush()?;
    Ok(())
}

///
/// Create the parent directory of `file` if needed
///
pub fn mkdir_parent(file: &str) -> anyhow::Result<()> {
    if let Some(dir) = Path::new(file).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}
