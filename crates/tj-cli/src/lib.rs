#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tj_io::{
    read_infile_list, read_source, split_selector_specs, write_table, FieldSelector, SourceFormat,
};
use tj_join::JoinExecutionOptions;
use tj_session::{JoinFlags, JoinSession};

const STDOUT_PATH: &str = "-";

/// tablejoin: join delimited-text files by selected fields
#[derive(Debug, Parser)]
#[command(
    name = "tablejoin",
    version,
    about = "Join files by selected fields (inner, left and outer join)",
    long_about = "Join two or more delimited-text files by selected key fields.\n\n\
                  Multiple key fields are supported. The default is an inner join; use \
                  -L/--left-join for a left join and -O/--outer-join for an outer join.\n\n\
                  Examples:\n  tablejoin -f id a.csv b.csv\n  tablejoin -f 'id,name;ID,NAME' -L a.csv b.csv"
)]
pub struct Args {
    /// Input files ('-' for stdin)
    #[arg(value_name = "FILES")]
    pub files: Vec<String>,

    /// File listing more input files, one per line
    #[arg(long = "infile-list", value_name = "FILE")]
    pub infile_list: Option<String>,

    /// Semicolon separated key fields of all files, e.g. "1;2", "A,B;C,D" or "id". A single selector applies to every file
    #[arg(short = 'f', long = "fields", value_name = "FIELDS", default_value = "1")]
    pub fields: String,

    /// Treat key names as wildcard patterns, e.g. "*name"
    #[arg(short = 'F', long = "fuzzy-fields")]
    pub fuzzy_fields: bool,

    /// Compare keys case-insensitively
    #[arg(short = 'i', long = "ignore-case")]
    pub ignore_case: bool,

    /// Keep unmatched rows of the first file
    #[arg(short = 'k', long = "keep-unmatched")]
    pub keep_unmatched: bool,

    /// Left join, exclusive with --outer-join
    #[arg(short = 'L', long = "left-join")]
    pub left_join: bool,

    /// Outer join, exclusive with --left-join
    #[arg(short = 'O', long = "outer-join")]
    pub outer_join: bool,

    /// Content for filling missing values
    #[arg(long = "na", env = "TABLEJOIN_NA", default_value = "")]
    pub na: String,

    /// Do not match empty keys
    #[arg(short = 'n', long = "ignore-null")]
    pub ignore_null: bool,

    /// Prefix column names with their file name; adds a header to header-less input
    #[arg(short = 'p', long = "prefix-filename")]
    pub prefix_filename: bool,

    /// Trim the extension when prefixing with the file name
    #[arg(short = 'e', long = "prefix-trim-ext")]
    pub prefix_trim_ext: bool,

    /// Prefix or suffix only column names seen in an earlier file
    #[arg(short = 'P', long = "only-duplicates")]
    pub only_duplicates: bool,

    /// Comma separated suffixes for column names, one per file
    #[arg(short = 's', long = "suffix", value_delimiter = ',')]
    pub suffixes: Vec<String>,

    /// Input files have no header row
    #[arg(short = 'H', long = "no-header-row")]
    pub no_header_row: bool,

    /// Input files are tab-delimited
    #[arg(short = 't', long = "tabs")]
    pub tabs: bool,

    /// Input field delimiter
    #[arg(short = 'd', long = "delimiter", default_value_t = ',')]
    pub delimiter: char,

    /// Output field delimiter
    #[arg(short = 'D', long = "out-delimiter", default_value_t = ',')]
    pub out_delimiter: char,

    /// Tab-delimited output
    #[arg(short = 'T', long = "out-tabs")]
    pub out_tabs: bool,

    /// Lines starting with this character are ignored
    #[arg(short = 'C', long = "comment-char")]
    pub comment_char: Option<char>,

    /// Do not write the header row
    #[arg(short = 'U', long = "delete-header")]
    pub delete_header: bool,

    /// Output file ('-' for stdout)
    #[arg(short = 'o', long = "out-file", default_value = "-")]
    pub out_file: String,

    /// Abort when one merge step would produce more rows than this
    #[arg(long = "max-rows", value_name = "N")]
    pub max_rows: Option<usize>,

    /// Build merge pairs with the global allocator instead of an arena
    #[arg(long = "no-arena")]
    pub no_arena: bool,

    /// Write a JSON run report (configuration, decisions, row counts) here
    #[arg(long = "report", value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    fn source_format(&self) -> Result<SourceFormat> {
        let delimiter = if self.tabs {
            b'\t'
        } else {
            ascii_byte(self.delimiter, "--delimiter")?
        };
        let comment = self
            .comment_char
            .map(|c| ascii_byte(c, "--comment-char"))
            .transpose()?;
        Ok(SourceFormat {
            delimiter,
            has_header: !self.no_header_row,
            comment,
        })
    }

    fn out_delimiter(&self) -> Result<u8> {
        if (self.out_tabs || self.tabs) && self.out_delimiter == ',' {
            return Ok(b'\t');
        }
        ascii_byte(self.out_delimiter, "--out-delimiter")
    }

    fn sources(&self) -> Result<Vec<String>> {
        let mut files = self.files.clone();
        if let Some(list) = &self.infile_list {
            files.extend(
                read_infile_list(list).with_context(|| format!("cannot read infile list {list}"))?,
            );
        }
        Ok(files)
    }
}

fn ascii_byte(value: char, flag: &str) -> Result<u8> {
    if !value.is_ascii() {
        bail!("{flag} must be a single ASCII character, got {value:?}");
    }
    Ok(value as u8)
}

/// Installs the stderr subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

pub fn run(args: Args) -> Result<()> {
    let format = args.source_format()?;
    let out_delimiter = args.out_delimiter()?;

    let plan = JoinFlags {
        sources: args.sources()?,
        selectors: split_selector_specs(&args.fields)?,
        left_join: args.left_join,
        outer_join: args.outer_join,
        keep_unmatched: args.keep_unmatched,
        ignore_case: args.ignore_case,
        ignore_null: args.ignore_null,
        na: args.na.clone(),
        prefix_filename: args.prefix_filename,
        prefix_trim_ext: args.prefix_trim_ext,
        only_duplicates: args.only_duplicates,
        suffixes: args.suffixes.clone(),
        no_out_header: args.delete_header,
        max_rows: args.max_rows,
        execution: JoinExecutionOptions {
            use_arena: !args.no_arena,
            ..JoinExecutionOptions::default()
        },
    }
    .into_plan()?;

    let selectors = plan
        .sources
        .iter()
        .map(|source| FieldSelector::parse(&source.selector, args.fuzzy_fields))
        .collect::<Result<Vec<_>, _>>()?;

    let mut session = JoinSession::new(plan.config.clone());
    if session.needs_keyspace() {
        debug!(sources = plan.sources.len(), "collecting outer join keyspace");
        for (index, (source, selector)) in plan.sources.iter().zip(&selectors).enumerate() {
            if let Some(table) = read_source(&source.path, index, &format, selector)? {
                session.observe(&table)?;
            }
        }
    }

    for (index, (source, selector)) in plan.sources.iter().zip(&selectors).enumerate() {
        match read_source(&source.path, index, &format, selector)? {
            Some(table) => session.push(table)?,
            None => session.skip_empty(&source.path, "no content"),
        }
    }

    let (joined, report) = session.finish();
    info!(
        rows = report.output_rows,
        columns = report.output_columns,
        "join finished"
    );

    if args.out_file == STDOUT_PATH {
        let stdout = io::stdout();
        write_table(
            BufWriter::new(stdout.lock()),
            joined.header.as_deref(),
            &joined.rows,
            out_delimiter,
        )?;
    } else {
        let file = File::create(&args.out_file)
            .with_context(|| format!("cannot create output file {}", args.out_file))?;
        let mut writer = BufWriter::new(file);
        write_table(&mut writer, joined.header.as_deref(), &joined.rows, out_delimiter)?;
        writer.flush()?;
    }

    if let Some(path) = &args.report {
        fs::write(path, report.to_json_pretty()?)
            .with_context(|| format!("cannot write report {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::Args;

    #[test]
    fn command_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn tab_input_implies_tab_output_unless_overridden() {
        let args = Args::parse_from(["tablejoin", "-t", "a", "b"]);
        assert_eq!(args.out_delimiter().expect("delimiter"), b'\t');
        assert_eq!(args.source_format().expect("format").delimiter, b'\t');

        let args = Args::parse_from(["tablejoin", "-t", "-D", ";", "a", "b"]);
        assert_eq!(args.out_delimiter().expect("delimiter"), b';');
    }

    #[test]
    fn suffixes_split_on_commas_and_comment_char_is_a_byte() {
        let args = Args::parse_from(["tablejoin", "-s", "l,r", "-C", "#", "a", "b"]);
        assert_eq!(args.suffixes, vec!["l".to_owned(), "r".to_owned()]);
        assert_eq!(args.source_format().expect("format").comment, Some(b'#'));
    }

    #[test]
    fn non_ascii_delimiter_is_rejected() {
        let args = Args::parse_from(["tablejoin", "-d", "é", "a", "b"]);
        assert!(args.source_format().is_err());
    }
}
