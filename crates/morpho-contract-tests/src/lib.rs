#![forbid(unsafe_code)]


#[cfg(test)]
mod capture;
#[cfg(test)]
mod determinism;
#[cfg(test)]
mod feedback;
#[cfg(test)]
mod migration;
#[cfg(test)]
mod pacing;
