use serde::Deserialize;

use crate::exec::{ExecError, Invocation, SystemExecutor};

#[derive(thiserror::Error, Debug)]
pub enum AddressError {
    #[error("failed to list routes")]
    Routes(#[source] ExecError),
    #[error("failed to parse `ip -j route` output")]
    Parse(#[source] serde_json::Error),
    #[error("no default route with a preferred source address")]
    AddressNotFound,
}

#[derive(Debug, Deserialize)]
struct Route {
    dst: String,
    #[serde(default)]
    prefsrc: Option<String>,
}

/// The source address of the default route, which on a cloud VM is its primary address.
pub fn default_route_address(exec: &impl SystemExecutor) -> Result<String, AddressError> {
    let out = exec
        .read(&Invocation::new("ip").args(["-j", "route", "show", "default"]))
        .map_err(AddressError::Routes)?;
    parse_default_route_address(&out)
}

fn parse_default_route_address(json: &str) -> Result<String, AddressError> {
    let routes: Vec<Route> = serde_json::from_str(json.trim()).map_err(AddressError::Parse)?;
    routes
        .into_iter()
        .filter(|route| route.dst == "default")
        .find_map(|route| route.prefsrc.filter(|src| !src.is_empty()))
        .ok_or(AddressError::AddressNotFound)
}
