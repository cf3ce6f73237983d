//! Built-in routes and `.acl` file storage

use std::{
    fmt,
    fs,
    io::{self, BufReader, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
};

use log::trace;

use super::Acl;

/// Routing policy of a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Proxy everything
    All,
    BypassLan,
    BypassChina,
    BypassLanChina,
    Gfwlist,
    ChinaList,
    /// The user's own ruleset
    CustomRules,
}

impl Route {
    /// Names of every route
    pub const fn available_routes() -> &'static [&'static str] {
        &[
            "all",
            "bypass-lan",
            "bypass-china",
            "bypass-lan-china",
            "gfwlist",
            "china-list",
            "custom-rules",
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            Route::All => "all",
            Route::BypassLan => "bypass-lan",
            Route::BypassChina => "bypass-china",
            Route::BypassLanChina => "bypass-lan-china",
            Route::Gfwlist => "gfwlist",
            Route::ChinaList => "china-list",
            Route::CustomRules => "custom-rules",
        }
    }

    /// Whether the proxy process is started with an ACL file for this route
    pub fn uses_acl(&self) -> bool {
        !matches!(*self, Route::All)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error while parsing `Route` from string
#[derive(Debug, Clone, Copy)]
pub struct RouteError;

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid route")
    }
}

impl std::error::Error for RouteError {}

impl FromStr for Route {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Route, RouteError> {
        match s {
            "all" => Ok(Route::All),
            "bypass-lan" => Ok(Route::BypassLan),
            "bypass-china" => Ok(Route::BypassChina),
            "bypass-lan-china" => Ok(Route::BypassLanChina),
            "gfwlist" => Ok(Route::Gfwlist),
            "china-list" => Ok(Route::ChinaList),
            "custom-rules" => Ok(Route::CustomRules),
            _ => Err(RouteError),
        }
    }
}

/// Directory of `<id>.acl` files
#[derive(Debug, Clone)]
pub struct AclStore {
    dir: PathBuf,
}

impl AclStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> AclStore {
        AclStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the ruleset `id`
    pub fn file(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.acl"))
    }

    /// Load the ruleset `id`, a missing file is an empty ruleset
    pub fn load(&self, id: &str) -> io::Result<Acl> {
        let path = self.file(id);
        trace!("ACL loading from {:?}", path);
        match fs::File::open(&path) {
            Ok(file) => Acl::from_reader(BufReader::new(file), false),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Acl::new()),
            Err(err) => Err(err),
        }
    }

    /// Write the ruleset `id`
    pub fn save(&self, id: &str, acl: &Acl) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file(id);
        trace!("ACL saving to {:?}", path);
        fs::write(path, acl.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn route_names() {
        for route in [
            Route::All,
            Route::BypassLan,
            Route::BypassChina,
            Route::BypassLanChina,
            Route::Gfwlist,
            Route::ChinaList,
            Route::CustomRules,
        ] {
            assert_eq!(route.as_str().parse::<Route>().unwrap(), route);
        }
        for name in Route::available_routes() {
            assert_eq!(name.parse::<Route>().unwrap().as_str(), *name);
        }
        assert!("bypass".parse::<Route>().is_err());
        assert!(!Route::All.uses_acl());
        assert!(Route::BypassLan.uses_acl());
    }

    #[test]
    fn store_file_names() {
        let store = AclStore::new("/data/acl");
        assert_eq!(store.file("gfwlist"), Path::new("/data/acl/gfwlist.acl"));
    }
}
