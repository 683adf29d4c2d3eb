//! # 路径匹配器
//!
//! 把 `glob:PATTERN` 或 `regex:PATTERN` 编译成针对路径字符串的匹配器,
//! 供上层按模式筛选目录内容。glob 语义:
//!
//! - `?` 匹配除 `/` 外的任意单字符,`*` 匹配除 `/` 外的任意一串
//! - `**` 匹配包括 `/` 在内的任意一串
//! - `[...]`、`[!...]` 字符类,类内不允许出现 `/`
//! - `{a,b,c}` 选择分支,不可嵌套
//! - `\` 转义下一个字符
//!
//! glob 先翻译成锚定的正则再编译。

use regex::Regex;

use crate::error::{FsError, Result};

pub struct PathMatcher {
    regex: Regex,
}

/// 正则的元字符,出现在 glob 的字面位置时需要转义
const REGEX_META: &str = ".^$+{[]|()";

fn is_regex_meta(c: char) -> bool {
    REGEX_META.contains(c)
}

impl PathMatcher {
    /// 模式形如 `syntax:pattern`,语法只认 `glob` 与 `regex`
    pub fn compile(syntax_and_pattern: &str) -> Result<Self> {
        let (syntax, pattern) = syntax_and_pattern
            .split_once(':')
            .filter(|(s, p)| !s.is_empty() && !p.is_empty())
            .ok_or_else(|| {
                FsError::Invalid(format!("invalid pattern: {syntax_and_pattern}"))
            })?;

        let regex = if syntax.eq_ignore_ascii_case("glob") {
            glob_to_regex(pattern)?
        } else if syntax.eq_ignore_ascii_case("regex") {
            pattern.to_owned()
        } else {
            return Err(FsError::Invalid(format!("unsupported syntax: {syntax}")));
        };

        let regex = Regex::new(&regex)
            .map_err(|e| FsError::Invalid(format!("invalid regex pattern: {e}")))?;
        Ok(Self { regex })
    }

    #[inline]
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// glob 翻译成锚定正则。
/// 正则引擎不支持字符类交集,因此凡是覆盖 `/` 的范围一律按非法范围拒绝,
/// 取反类则直接把 `/` 并入取反集合。
fn glob_to_regex(glob: &str) -> Result<String> {
    let chars: Vec<char> = glob.chars().collect();
    let mut regex = String::from("^");
    let mut in_group = false;
    let mut i = 0;

    let err = |msg: &str| FsError::Invalid(format!("{msg} in glob: {glob}"));

    while i < chars.len() {
        let c = chars[i];
        i += 1;

        match c {
            '\\' => {
                if i == chars.len() {
                    return Err(err("no character to escape"));
                }
                let next = chars[i];
                i += 1;
                if is_regex_meta(next) || "\\*?[{}".contains(next) {
                    regex.push('\\');
                }
                regex.push(next);
            }
            '[' => {
                i = translate_class(&chars, i, &mut regex, &err)?;
            }
            '{' => {
                if in_group {
                    return Err(err("cannot nest groups"));
                }
                in_group = true;
                regex.push_str("(?:(?:");
            }
            '}' => {
                if in_group {
                    in_group = false;
                    regex.push_str("))");
                } else {
                    regex.push_str("\\}");
                }
            }
            ',' => {
                if in_group {
                    regex.push_str(")|(?:");
                } else {
                    regex.push(',');
                }
            }
            '*' => {
                if chars.get(i) == Some(&'*') {
                    i += 1;
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            _ => {
                if is_regex_meta(c) {
                    regex.push('\\');
                }
                regex.push(c);
            }
        }
    }

    if in_group {
        return Err(err("missing '}'"));
    }

    regex.push('$');
    Ok(regex)
}

/// 翻译一个字符类,返回类结束后的下标
fn translate_class(
    chars: &[char],
    mut i: usize,
    regex: &mut String,
    err: &dyn Fn(&str) -> FsError,
) -> Result<usize> {
    regex.push('[');

    if chars.get(i) == Some(&'!') {
        // 取反类天然排除分隔符
        regex.push_str("^/");
        i += 1;
    } else if chars.get(i) == Some(&'^') {
        regex.push_str("\\^");
        i += 1;
    }
    if chars.get(i) == Some(&'-') {
        regex.push('-');
        i += 1;
    }

    let mut range_start: Option<char> = None;
    let mut closed = false;

    while i < chars.len() {
        let c = chars[i];
        i += 1;

        match c {
            ']' => {
                closed = true;
                break;
            }
            '/' => return Err(err("explicit 'name separator' in class")),
            '-' => {
                let Some(start) = range_start.take() else {
                    return Err(err("invalid range"));
                };
                let Some(&end) = chars.get(i) else {
                    return Err(err("invalid range"));
                };
                if end == ']' {
                    // 末尾的 '-' 是字面量
                    regex.push('-');
                    range_start = None;
                    continue;
                }
                i += 1;
                if end < start || (start <= '/' && '/' <= end) {
                    return Err(err("invalid range"));
                }
                regex.push('-');
                if "\\[]^&".contains(end) {
                    regex.push('\\');
                }
                regex.push(end);
            }
            _ => {
                if "\\[]^&".contains(c) {
                    regex.push('\\');
                }
                regex.push(c);
                range_start = Some(c);
            }
        }
    }

    if !closed {
        return Err(err("missing ']'"));
    }

    regex.push(']');
    Ok(i)
}
