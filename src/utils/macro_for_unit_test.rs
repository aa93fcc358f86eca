/// 错误断言宏 - 灵活粒度验证 Result 错误
///
/// # 用法
/// - `assert_err!(expr)`：只验证是 Err
/// - `assert_err!(expr, Variant(literal))`：验证错误类型 + 精确消息（String 变体）
/// - `assert_err!(expr, ShapeMismatch(layer, exp, got))`：验证 ShapeMismatch（简洁语法）
/// - `assert_err!(expr, UnknownLayer(layer, reference))`：验证 UnknownLayer（简洁语法）
/// - `assert_err!(expr, Pattern { .. })`：验证错误类型
/// - `assert_err!(expr, Pattern { field, .. } if condition)`：验证类型 + 条件
///
/// # 示例
/// ```ignore
/// // 只验证是错误
/// assert_err!(result);
///
/// // 验证错误类型 + 精确消息（简洁语法）
/// assert_err!(result, RecError::UnknownCell("foo"));
///
/// // ShapeMismatch 简洁语法（按顺序：layer, expected, got）
/// assert_err!(result, RecError::ShapeMismatch("output", [2, 3], [2, 4]));
///
/// // 验证错误类型（忽略所有字段）
/// assert_err!(result, RecError::ShapeMismatch { .. });
///
/// // 验证消息包含关键词
/// assert_err!(result, RecError::Config(msg) if msg.contains("n_out"));
/// ```
#[macro_export]
macro_rules! assert_err {
    // 只验证是 Err
    ($expr:expr) => {
        assert!($expr.is_err(), "预期 Err，实际得到 {:?}", $expr);
    };
    // 简洁语法：Variant(字符串字面量) - 精确匹配 String 内容
    ($expr:expr, $err_type:ident :: $variant:ident ( $expected:literal )) => {
        match &$expr {
            Err($err_type::$variant(actual)) => assert_eq!(
                actual, $expected,
                "错误消息不匹配：预期 `{}`，实际得到 `{}`",
                $expected, actual
            ),
            Err(e) => panic!(
                "错误类型不匹配：预期 `{}::{}`，实际得到 `{:?}`",
                stringify!($err_type), stringify!($variant), e
            ),
            Ok(v) => panic!(
                "预期 Err({}::{})，实际得到 Ok({:?})",
                stringify!($err_type), stringify!($variant), v
            ),
        }
    };
    // 简洁语法：ShapeMismatch(layer, expected, got)
    ($expr:expr, $err_type:ident :: ShapeMismatch ( $layer:expr, $exp:expr, $got:expr )) => {
        match &$expr {
            Err($err_type::ShapeMismatch { layer, expected, got }) => {
                assert_eq!(layer, $layer, "layer 不匹配");
                assert_eq!(expected.as_slice(), &$exp, "expected 不匹配");
                assert_eq!(got.as_slice(), &$got, "got 不匹配");
            }
            Err(e) => panic!(
                "错误类型不匹配：预期 `{}::ShapeMismatch`，实际得到 `{:?}`",
                stringify!($err_type), e
            ),
            Ok(v) => panic!(
                "预期 Err({}::ShapeMismatch)，实际得到 Ok({:?})",
                stringify!($err_type), v
            ),
        }
    };
    // 简洁语法：UnknownLayer(layer, reference)
    ($expr:expr, $err_type:ident :: UnknownLayer ( $layer:expr, $reference:expr )) => {
        match &$expr {
            Err($err_type::UnknownLayer { layer, reference }) => {
                assert_eq!(layer, $layer, "layer 不匹配");
                assert_eq!(reference, $reference, "reference 不匹配");
            }
            Err(e) => panic!(
                "错误类型不匹配：预期 `{}::UnknownLayer`，实际得到 `{:?}`",
                stringify!($err_type), e
            ),
            Ok(v) => panic!(
                "预期 Err({}::UnknownLayer)，实际得到 Ok({:?})",
                stringify!($err_type), v
            ),
        }
    };
    // 通用模式匹配（带 if guard 或复杂 pattern）
    ($expr:expr, $($pattern:tt)+) => {
        match &$expr {
            Err(e) => assert!(
                matches!(e, $($pattern)+),
                "错误类型不匹配：预期 `{}`，实际得到 `{:?}`",
                stringify!($($pattern)+),
                e
            ),
            Ok(v) => panic!(
                "预期 Err 匹配 `{}`，实际得到 Ok({:?})",
                stringify!($($pattern)+),
                v
            ),
        }
    };
}
