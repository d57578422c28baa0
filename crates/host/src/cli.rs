use std::path::PathBuf;

use clap::Parser;

const PROD_API_URL: &str = "https://api.faunawatch.nz";
const TEST_API_URL: &str = "https://api-test.faunawatch.nz";
const IR_API_URL: &str = "https://api-ir.faunawatch.nz";

#[derive(Debug, Clone, Parser)]
#[command(name = "faunaproc", version, about = "Recording processing worker host")]
pub struct Cli {
    /// Path to the config file to use.
    #[arg(short = 'c', long, env = "FAUNAPROC_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// API user email, overriding the config file.
    #[arg(long)]
    pub user: Option<String>,

    /// API password, overriding the config file.
    #[arg(long)]
    pub password: Option<String>,

    /// API server: an absolute URL, or one of `prod`, `test`, `ir`.
    #[arg(long)]
    pub api: Option<String>,
}

impl Cli {
    /// The API URL override, with the deployment aliases resolved.
    pub fn api_url(&self) -> Option<String> {
        self.api.as_deref().map(|api| {
            match api {
                "prod" => PROD_API_URL,
                "test" => TEST_API_URL,
                "ir" => IR_API_URL,
                url => url,
            }
            .to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_aliases_resolve() {
        let mut cli = Cli::parse_from(["faunaproc", "--api", "test"]);
        assert_eq!(cli.api_url().as_deref(), Some(TEST_API_URL));

        cli.api = Some("http://127.0.0.1:1080".to_string());
        assert_eq!(cli.api_url().as_deref(), Some("http://127.0.0.1:1080"));

        cli.api = None;
        assert_eq!(cli.api_url(), None);
    }
}
