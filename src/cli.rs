pub struct Args {
    pub debug_layers: bool,
    pub msaa: u32,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
    pub gpu: usize,
}

impl Default for Args {
    fn default() -> Args {
        Args {
            debug_layers: false,
            msaa: 4,
            width: 1280,
            height: 720,
            resizable: true,
            gpu: 0,
        }
    }
}

impl Args {
    pub fn parse() -> Args {
        match Args::parse_from(std::env::args().skip(1)) {
            Ok(args) => args,
            Err(message) => {
                eprintln!("{message}");
                std::process::exit(1);
            }
        }
    }

    fn parse_from(raw: impl Iterator<Item = String>) -> Result<Args, String> {
        let mut args = Args::default();
        let mut raw = raw;
        while let Some(flag) = raw.next() {
            let mut value = |flag: &str| {
                raw.next()
                    .ok_or_else(|| format!("missing value for {flag}"))
            };
            match flag.as_str() {
                "--debug-layers" => args.debug_layers = parse_bool(&value(&flag)?, &flag)?,
                "--msaa" => args.msaa = parse_number(&value(&flag)?, &flag)?,
                "--width" => args.width = parse_number(&value(&flag)?, &flag)?,
                "--height" => args.height = parse_number(&value(&flag)?, &flag)?,
                "--resizable" => args.resizable = parse_bool(&value(&flag)?, &flag)?,
                "--gpu" => args.gpu = parse_number(&value(&flag)?, &flag)?,
                unknown => return Err(format!("unknown flag {unknown}")),
            }
        }
        if !args.msaa.is_power_of_two() || args.msaa > 64 {
            return Err(format!("invalid MSAA sample count {}", args.msaa));
        }
        Ok(args)
    }
}

fn parse_bool(text: &str, flag: &str) -> Result<bool, String> {
    match text {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(format!("invalid value {text} for {flag}, expected 0 or 1")),
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, flag: &str) -> Result<T, String> {
    text.parse()
        .map_err(|_| format!("invalid value {text} for {flag}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, String> {
        Args::parse_from(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn defaults_when_empty() {
        let args = parse(&[]).unwrap();
        assert!(!args.debug_layers);
        assert_eq!(args.msaa, 4);
        assert_eq!(args.gpu, 0);
    }

    #[test]
    fn full_flag_set() {
        let args = parse(&[
            "--debug-layers",
            "1",
            "--msaa",
            "8",
            "--width",
            "800",
            "--height",
            "600",
            "--resizable",
            "0",
            "--gpu",
            "1",
        ])
        .unwrap();
        assert!(args.debug_layers);
        assert_eq!(args.msaa, 8);
        assert_eq!(args.width, 800);
        assert_eq!(args.height, 600);
        assert!(!args.resizable);
        assert_eq!(args.gpu, 1);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(parse(&["--fullscreen"]).is_err());
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(parse(&["--width"]).is_err());
    }

    #[test]
    fn non_power_of_two_msaa_is_an_error() {
        assert!(parse(&["--msaa", "3"]).is_err());
    }
}
