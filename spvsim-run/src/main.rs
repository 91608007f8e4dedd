//! spvsim-run - interpret SPIR-V shaders from the command line.
use std::io::Read;
use std::process::exit;

use clap::error::ErrorKind;
use clap::Parser;
use spvsim_exec::Program;
use spvsim_fmt::Format;
use spvsim_value::value::ValueMap;

mod debug;
mod trie;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReturnCode {
    Ok = 0,
    Info = 1,
    BadArgs = 2,
    BadFile = 3,
    BadParse = 4,
    BadProgram = 5,
    BadProgInput = 6,
    FailedExe = 7,
    BadCompare = 8,
}

/// Interpret SPIR-V shaders.
///
/// 'SPV' is a path to a spv file, which must have an OpEntryPoint
/// instruction. For all options which accept FILE, "-" may be given to use
/// stdin or stdout instead.
#[derive(Parser, Debug)]
#[command(name = "spvsim-run", disable_version_flag = true)]
struct Args {
    /// Check the output against the specified file. Returns 0 if equal.
    #[arg(short, long, value_name = "FILE")]
    check: Option<String>,

    /// Launch an interactive execution. Enables --print implicitly.
    #[arg(short, long)]
    debug: bool,

    /// Generate default values for the template file instead of <type>
    /// stubs. Enables --template implicitly.
    #[arg(short = 'g', long = "default")]
    defaults: bool,

    /// Specify a default value format from {"yaml", "json"}. The
    /// interpreter will try to assume the desired format from the
    /// extension of the file to read or write, but this argument is still
    /// useful for --set pairs, stdout, or if the extension is not
    /// recognized.
    #[arg(short, long, value_name = "FORMAT", default_value = "yaml")]
    format: String,

    /// Specify a file to fetch input from. Alternatively, input may be
    /// specified in key-value pairs with --set.
    #[arg(short, long, value_name = "FILE")]
    r#in: Option<String>,

    /// Specify the size of each indent (in spaces) for outputs. Applies
    /// to JSON output; YAML always indents by two.
    #[arg(short = 'n', long, value_name = "SIZE", default_value_t = 2)]
    indent: usize,

    /// Specify a file to output to. By default, output prints to stdout.
    #[arg(short, long, value_name = "FILE")]
    out: Option<String>,

    /// Enable verbose printing.
    #[arg(short, long)]
    print: bool,

    /// Define a KEY=VAL input pair in the default format. May be given
    /// more than once.
    #[arg(short, long, value_name = "KEY_VAL")]
    set: Vec<String>,

    /// Creates a template input file with stubs for all needed inputs. If
    /// --default is set, the default values will be printed instead of
    /// <type> stubs.
    #[arg(short, long, value_name = "FILE")]
    template: Option<String>,

    /// Print version info and exit.
    #[arg(short = 'v', long)]
    version: bool,

    /// Path to the SPIR-V module to interpret.
    #[arg(value_name = "SPV")]
    spv: Option<String>,
}

fn read_source(path: &str) -> Result<Vec<u8>, ReturnCode> {
    if path == "-" {
        let mut buffer = Vec::new();
        std::io::stdin().read_to_end(&mut buffer).map_err(|e| {
            eprintln!("could not read stdin: {}", e);
            ReturnCode::BadFile
        })?;
        Ok(buffer)
    } else {
        std::fs::read(path).map_err(|_| {
            eprintln!("could not open source file \"{}\"!", path);
            ReturnCode::BadFile
        })
    }
}

fn load_values(
    program: &mut Program,
    file_name: &str,
    preference: Format,
    into: &mut ValueMap,
) -> Result<(), ReturnCode> {
    let text = if file_name == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text).map_err(|e| {
            eprintln!("could not read stdin: {}", e);
            ReturnCode::BadFile
        })?;
        text
    } else {
        std::fs::read_to_string(file_name).map_err(|_| {
            eprintln!("could not open file \"{}\"!", file_name);
            ReturnCode::BadFile
        })?
    };
    let format = Format::for_file(file_name, preference);
    format
        .parse_str(program.arena_mut(), &text, into)
        .map_err(|e| {
            eprintln!("{}", e);
            ReturnCode::BadParse
        })
}

fn write_out(path: &str, text: &str) -> Result<(), ReturnCode> {
    if path == "-" {
        print!("{}", text);
        Ok(())
    } else {
        std::fs::write(path, text).map_err(|e| {
            eprintln!("could not write \"{}\": {}", path, e);
            ReturnCode::BadFile
        })
    }
}

fn run(args: Args) -> ReturnCode {
    if args.version {
        println!("spvsim version {}", env!("CARGO_PKG_VERSION"));
        return ReturnCode::Info;
    }
    let spv = match args.spv.clone() {
        Some(spv) => spv,
        None => {
            eprintln!("Missing positional argument: spv input");
            return ReturnCode::BadArgs;
        }
    };

    let format = match Format::from_name(&args.format) {
        Some(format) => format,
        None => {
            eprintln!("unknown format \"{}\"; expected yaml or json", args.format);
            return ReturnCode::BadArgs;
        }
    };
    let verbose = args.print || args.debug;
    let template_arg = match (&args.template, args.defaults) {
        (None, true) => Some("-".to_owned()),
        (t, _) => t.clone(),
    };

    let bytes = match read_source(&spv) {
        Ok(bytes) => bytes,
        Err(code) => return code,
    };
    let mut program = Program::new();
    if let Err(e) = program.parse(&spv, &bytes) {
        eprintln!("{}", e);
        return ReturnCode::BadParse;
    }

    // Inputs load before init: specialization constants must know their
    // values before interface types (and templates) are settled.
    let mut inputs = ValueMap::new();
    if let Some(in_file) = &args.r#in {
        if let Err(code) = load_values(&mut program, in_file, format, &mut inputs) {
            return code;
        }
    }
    for pair in &args.set {
        if let Err(e) = format.parse_set(program.arena_mut(), pair, &mut inputs) {
            eprintln!("{}", e);
            return ReturnCode::BadParse;
        }
    }

    if let Err(e) = program.init(&inputs) {
        eprintln!("{}", e);
        return ReturnCode::BadProgram;
    }

    if let Some(template) = template_arg {
        let prog_inputs = match program.get_inputs() {
            Ok(inputs) => inputs,
            Err(e) => {
                eprintln!("{}", e);
                return ReturnCode::BadProgram;
            }
        };
        let out_format = Format::for_file(&template, format);
        let rendered = match spvsim_fmt::template::render(
            out_format,
            program.arena(),
            &prog_inputs,
            args.defaults,
            args.indent,
        ) {
            Ok(rendered) => rendered,
            Err(e) => {
                eprintln!("{}", e);
                return ReturnCode::BadProgram;
            }
        };
        if let Err(code) = write_out(&template, &rendered) {
            return code;
        }
        return ReturnCode::Info;
    }

    if let Err(e) = program.check_inputs(&inputs, false) {
        eprintln!("{}", e);
        return ReturnCode::BadProgInput;
    }

    let mut debugger = debug::Debugger::new();
    let inspector: Option<&mut dyn spvsim_exec::program::Inspector> = if args.debug {
        Some(&mut debugger)
    } else {
        None
    };
    if let Err(e) = program.execute(verbose, inspector) {
        eprintln!("{}", e);
        return ReturnCode::FailedExe;
    }

    // Print the outputs unless only checking was requested.
    if args.check.is_none() || args.out.is_some() {
        let outputs = match program.get_outputs() {
            Ok(outputs) => outputs,
            Err(e) => {
                eprintln!("{}", e);
                return ReturnCode::FailedExe;
            }
        };
        let out = args.out.clone().unwrap_or_else(|| "-".to_owned());
        let out_format = Format::for_file(&out, format);
        let rendered = match out_format.print(program.arena(), &outputs, args.indent) {
            Ok(rendered) => rendered,
            Err(e) => {
                eprintln!("{}", e);
                return ReturnCode::FailedExe;
            }
        };
        if verbose && out == "-" {
            println!("\nResults=");
        }
        if let Err(code) = write_out(&out, &rendered) {
            return code;
        }
    }

    if let Some(check) = &args.check {
        let mut expected = ValueMap::new();
        if let Err(code) = load_values(&mut program, check, format, &mut expected) {
            return code;
        }
        match program.check_outputs(&expected) {
            Ok((true, total)) => {
                if total == 1 {
                    println!("{} output matches!", total);
                } else {
                    println!("{} outputs match!", total);
                }
            }
            Ok((false, _)) => {
                eprintln!("Output did NOT match!");
                return ReturnCode::BadCompare;
            }
            Err(e) => {
                eprintln!("{}", e);
                return ReturnCode::BadCompare;
            }
        }
    }

    ReturnCode::Ok
}

fn main() {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ReturnCode::Info,
                _ => ReturnCode::BadArgs,
            };
            let _ = e.print();
            exit(code as i32);
        }
    };
    exit(run(args) as i32);
}
