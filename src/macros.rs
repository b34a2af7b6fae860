/// Implements [`RpcFunction::name`](crate::RpcFunction::name).
#[macro_export]
macro_rules! name {
    ($name:expr) => {
        fn name(&self) -> &str {
            $name
        }
    };
}

/// Builds a [`DispatchTable`](crate::DispatchTable) from `"method" => handler` pairs.
///
/// ```
/// use wsrpc::dispatch_table;
///
/// let table = dispatch_table! {
///     "Echo" => |args, _kwargs| Ok(args.into_iter().next().unwrap_or_default()),
/// };
/// assert!(table.resolve("Echo").is_some());
/// ```
#[macro_export]
macro_rules! dispatch_table {
    ($($method:expr => $handler:expr),* $(,)?) => {{
        let mut table = $crate::DispatchTable::new();
        $(
            table.insert($method, $handler);
        )*
        table
    }};
}
