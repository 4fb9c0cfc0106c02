#[cfg(test)]
mod core;
#[cfg(test)]
mod support;
