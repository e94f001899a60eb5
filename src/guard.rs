use crate::models::{CandidateQuery, GuardedQuery, SchemaDescription};

/// 守卫错误: 对同一输入是确定性的, 一律不重试
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("statement kind is not read-only retrieval")]
    DisallowedStatementKind,
    #[error("multiple statements are not allowed")]
    MultiStatementRejected,
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("disallowed function: {0}")]
    DisallowedFunction(String),
}

/// 只读检索语句里允许出现的关键字与类型名
const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "NULL", "IS", "IN", "LIKE", "ILIKE",
    "SIMILAR", "BETWEEN", "AS", "ON", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER",
    "CROSS", "GROUP", "BY", "HAVING", "ORDER", "ASC", "DESC", "LIMIT", "OFFSET", "DISTINCT",
    "UNION", "INTERSECT", "EXCEPT", "ALL", "ANY", "SOME", "CASE", "WHEN", "THEN", "ELSE",
    "END", "EXISTS", "WITH", "TRUE", "FALSE", "USING", "NATURAL", "FILTER", "OVER",
    "PARTITION", "ROWS", "RANGE", "FETCH", "FIRST", "NEXT", "ONLY", "NULLS", "LAST",
    "INTERVAL", "EPOCH", "YEAR", "QUARTER", "MONTH", "WEEK", "DAY", "DOW", "HOUR", "MINUTE",
    "SECOND", "CURRENT_DATE", "CURRENT_TIMESTAMP", "CAST",
    // 类型名 (CAST/:: 右侧)
    "NUMERIC", "DECIMAL", "INTEGER", "INT", "INT4", "INT8", "BIGINT", "SMALLINT", "REAL",
    "FLOAT", "DOUBLE", "PRECISION", "TEXT", "VARCHAR", "CHAR", "BOOLEAN", "DATE",
    "TIMESTAMP", "TIMESTAMPTZ",
];

/// 出现即判定为非只读语句形态的关键字
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
    "COPY", "VACUUM", "ANALYZE", "REINDEX", "CLUSTER", "COMMENT", "SET", "RESET", "EXECUTE",
    "PREPARE", "DEALLOCATE", "DECLARE", "LOCK", "LISTEN", "NOTIFY", "CALL", "DO", "MERGE",
    "REPLACE", "INTO", "RETURNING", "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT",
];

/// 函数白名单 (聚合/数学/字符串/日期); 名单之外一律拒绝
const ALLOWED_FUNCTIONS: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "STRING_AGG",
    "COALESCE", "NULLIF", "GREATEST", "LEAST",
    "ABS", "ROUND", "TRUNC", "CEIL", "CEILING", "FLOOR", "SIGN", "MOD", "POWER", "SQRT",
    "LOWER", "UPPER", "INITCAP", "TRIM", "LTRIM", "RTRIM", "BTRIM", "LENGTH", "CHAR_LENGTH",
    "SUBSTR", "SUBSTRING", "REPLACE", "CONCAT", "CONCAT_WS", "SPLIT_PART", "POSITION",
    "STRPOS",
    "TO_CHAR", "TO_DATE", "TO_NUMBER", "DATE_TRUNC", "DATE_PART", "EXTRACT", "AGE", "NOW",
];

/// 显式拒绝的侧信道/注入混淆函数 (文件访问/外联/后端控制/随机化)
const DENIED_FUNCTIONS: &[&str] = &[
    "PG_SLEEP", "PG_READ_FILE", "PG_READ_BINARY_FILE", "PG_LS_DIR", "PG_STAT_FILE",
    "PG_TERMINATE_BACKEND", "PG_CANCEL_BACKEND", "PG_RELOAD_CONF", "PG_ROTATE_LOGFILE",
    "LO_IMPORT", "LO_EXPORT", "DBLINK", "DBLINK_EXEC", "DBLINK_CONNECT", "SET_CONFIG",
    "CURRENT_SETTING", "QUERY_TO_XML", "DATABASE_TO_XML", "TABLE_TO_XML", "RANDOM",
    "SETSEED", "GEN_RANDOM_UUID", "PG_ADVISORY_LOCK", "PG_NOTIFY",
];

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Dot,
    LParen,
    Star,
    Semicolon,
}

/// 候选语句静态检查: 这是模型输出与数据库之间唯一的闸门
/// 规则按序短路: 语句形态 -> 单语句 -> 标识符接地 -> 行数上限 -> 函数白名单
pub fn check(
    candidate: &CandidateQuery,
    schema: &SchemaDescription,
    max_rows: u64,
) -> Result<GuardedQuery, GuardError> {
    // 注释与字符串字面量先剥离, 检查只看语句结构本身
    let scrubbed = scrub(&candidate.sql);
    let scrubbed = strip_trailing_semicolon(&scrubbed);
    let toks = tokenize(scrubbed);

    // 1. 语句形态: 必须以 SELECT/WITH 开头
    match toks.first() {
        Some(Tok::Word(w)) if is_select_head(w) => {}
        _ => return Err(GuardError::DisallowedStatementKind),
    }

    // 2. 单语句: 剥离字面量后残留的分隔符即多语句
    if toks.contains(&Tok::Semicolon) {
        return Err(GuardError::MultiStatementRejected);
    }

    // 1b. 语句体内出现任何写入/DDL/事务关键字, 同属形态违规
    for tok in &toks {
        if let Tok::Word(w) = tok {
            if FORBIDDEN_KEYWORDS.contains(&w.to_ascii_uppercase().as_str()) {
                return Err(GuardError::DisallowedStatementKind);
            }
        }
    }

    let aliases = collect_aliases(&toks, schema);
    let functions = collect_functions(&toks);

    // 3. 标识符接地: 引用的表/列必须存在于实时 Schema
    ground_identifiers(&toks, schema, &aliases)?;

    // 4. 行数上限: 候选语句未自带 LIMIT/FETCH 时注入, 约束内存与响应体量
    let has_bound = toks.iter().any(|t| {
        matches!(t, Tok::Word(w) if {
            let u = w.to_ascii_uppercase();
            u == "LIMIT" || u == "FETCH"
        })
    });
    let base_sql = strip_trailing_semicolon(candidate.sql.trim()).trim_end().to_string();
    let (sql, was_modified) = if has_bound {
        (base_sql, false)
    } else {
        (format!("{base_sql} LIMIT {max_rows}"), true)
    };

    // 5. 函数白名单: 显式拒绝名单命中或名单外函数一律拒绝
    for func in &functions {
        let upper = func.to_ascii_uppercase();
        if DENIED_FUNCTIONS.contains(&upper.as_str()) || !ALLOWED_FUNCTIONS.contains(&upper.as_str())
        {
            return Err(GuardError::DisallowedFunction(func.clone()));
        }
    }

    Ok(GuardedQuery { sql, was_modified })
}

fn is_select_head(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    upper == "SELECT" || upper == "WITH"
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word.to_ascii_uppercase().as_str())
}

/// 去掉注释与字符串字面量内容 ('' 转义按 SQL 规则处理)
fn scrub(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                // 字符串字面量: 吞掉内容, 保留空引号占位
                out.push_str("''");
                while let Some(inner) = chars.next() {
                    if inner == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next(); // '' 转义, 继续在字面量内
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

/// 允许一个收尾分号, 其余分号留给多语句检查
fn strip_trailing_semicolon(sql: &str) -> &str {
    let trimmed = sql.trim_end();
    trimmed.strip_suffix(';').map(str::trim_end).unwrap_or(trimmed)
}

fn tokenize(sql: &str) -> Vec<Tok> {
    let mut toks = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_alphanumeric() || d == '_' {
                    word.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            toks.push(Tok::Word(word));
        } else if c.is_ascii_digit() {
            // 数字字面量 (含小数/指数), 整体跳过
            chars.next();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    chars.next();
                } else if d == 'e' || d == 'E' {
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
        } else if c == '"' {
            // 带引号标识符
            chars.next();
            let mut word = String::new();
            for d in chars.by_ref() {
                if d == '"' {
                    break;
                }
                word.push(d);
            }
            toks.push(Tok::Word(word));
        } else {
            chars.next();
            match c {
                '.' => toks.push(Tok::Dot),
                '(' => toks.push(Tok::LParen),
                '*' => toks.push(Tok::Star),
                ';' => toks.push(Tok::Semicolon),
                _ => {}
            }
        }
    }
    toks
}

/// 收集别名: CTE 名/表别名/输出列别名, 接地时视为已知
fn collect_aliases(toks: &[Tok], schema: &SchemaDescription) -> Vec<String> {
    let mut aliases = Vec::new();
    for (i, tok) in toks.iter().enumerate() {
        let Tok::Word(word) = tok else { continue };

        // `x AS ...` 形式: x 是 CTE 名或被别名的来源, 记下无害
        if word.eq_ignore_ascii_case("as") {
            if let Some(Tok::Word(next)) = toks.get(i + 1) {
                if !is_keyword(next) {
                    aliases.push(next.to_ascii_lowercase());
                }
            }
            continue;
        }
        if let Some(Tok::Word(next)) = toks.get(i + 1) {
            if next.eq_ignore_ascii_case("as") {
                aliases.push(word.to_ascii_lowercase());
                continue;
            }
            // 隐式表别名: FROM documents d
            if schema.has_table(word)
                && !is_keyword(next)
                && toks.get(i + 2) != Some(&Tok::LParen)
            {
                aliases.push(next.to_ascii_lowercase());
            }
        }
    }
    aliases
}

/// 函数名 = 紧跟左括号的非关键字单词
fn collect_functions(toks: &[Tok]) -> Vec<String> {
    let mut functions = Vec::new();
    for (i, tok) in toks.iter().enumerate() {
        if let Tok::Word(word) = tok {
            if toks.get(i + 1) == Some(&Tok::LParen) && !is_keyword(word) {
                functions.push(word.clone());
            }
        }
    }
    functions
}

fn ground_identifiers(
    toks: &[Tok],
    schema: &SchemaDescription,
    aliases: &[String],
) -> Result<(), GuardError> {
    let known_bare = |word: &str| -> bool {
        is_keyword(word)
            || schema.has_table(word)
            || schema.has_column(word)
            || aliases.contains(&word.to_ascii_lowercase())
    };

    let mut i = 0;
    while i < toks.len() {
        let Tok::Word(word) = &toks[i] else {
            i += 1;
            continue;
        };

        // 函数名由规则 5 处理
        if toks.get(i + 1) == Some(&Tok::LParen) {
            i += 1;
            continue;
        }

        // 限定引用 qualifier.column / qualifier.*
        if toks.get(i + 1) == Some(&Tok::Dot) {
            let qualifier_ok =
                schema.has_table(word) || aliases.contains(&word.to_ascii_lowercase());
            if !qualifier_ok {
                return Err(GuardError::UnknownIdentifier(word.clone()));
            }
            match toks.get(i + 2) {
                Some(Tok::Star) => {}
                Some(Tok::Word(column)) => {
                    let column_ok = if schema.has_table(word) {
                        schema.table_has_column(word, column)
                    } else {
                        // 别名在不重建完整解析树的前提下无法绑定到具体表, 放宽到任意已知列
                        schema.has_column(column)
                    };
                    if !column_ok {
                        return Err(GuardError::UnknownIdentifier(format!("{word}.{column}")));
                    }
                }
                _ => return Err(GuardError::UnknownIdentifier(word.clone())),
            }
            i += 3;
            continue;
        }

        if !known_bare(word) {
            return Err(GuardError::UnknownIdentifier(word.clone()));
        }
        i += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnDescription;
    use indexmap::IndexMap;

    fn schema() -> SchemaDescription {
        let mut tables = IndexMap::new();
        tables.insert(
            "documents".to_string(),
            ["id", "vendor_name", "invoice_date", "total_amount", "tax_amount", "created_at"]
                .iter()
                .map(|c| ColumnDescription {
                    name: (*c).to_string(),
                    sql_type: "TEXT".to_string(),
                })
                .collect(),
        );
        tables.insert(
            "items".to_string(),
            ["id", "document_id", "description", "quantity", "line_total"]
                .iter()
                .map(|c| ColumnDescription {
                    name: (*c).to_string(),
                    sql_type: "TEXT".to_string(),
                })
                .collect(),
        );
        SchemaDescription { tables }
    }

    fn candidate(sql: &str) -> CandidateQuery {
        CandidateQuery {
            sql: sql.to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn mutating_statement_is_rejected() {
        let err = check(&candidate("DROP TABLE documents"), &schema(), 500).unwrap_err();
        assert_eq!(err, GuardError::DisallowedStatementKind);
    }

    #[test]
    fn select_into_is_rejected() {
        let err = check(
            &candidate("SELECT vendor_name INTO stolen FROM documents"),
            &schema(),
            500,
        )
        .unwrap_err();
        assert_eq!(err, GuardError::DisallowedStatementKind);
    }

    #[test]
    fn separator_means_multi_statement() {
        let err = check(
            &candidate("SELECT id FROM documents; DELETE FROM documents"),
            &schema(),
            500,
        )
        .unwrap_err();
        assert_eq!(err, GuardError::MultiStatementRejected);
    }

    #[test]
    fn trailing_semicolon_is_tolerated() {
        let q = check(&candidate("SELECT id FROM documents;"), &schema(), 500).unwrap();
        assert_eq!(q.sql, "SELECT id FROM documents LIMIT 500");
    }

    #[test]
    fn separator_inside_string_literal_is_fine() {
        let q = check(
            &candidate("SELECT id FROM documents WHERE vendor_name = 'a;b'"),
            &schema(),
            500,
        )
        .unwrap();
        assert!(q.was_modified);
    }

    #[test]
    fn forbidden_keyword_inside_comment_is_ignored() {
        let q = check(
            &candidate("SELECT id FROM documents -- DROP TABLE documents"),
            &schema(),
            500,
        )
        .unwrap();
        assert!(q.sql.starts_with("SELECT id FROM documents"));
    }

    #[test]
    fn unknown_column_is_ungrounded() {
        let err = check(
            &candidate("SELECT secret_col FROM documents"),
            &schema(),
            500,
        )
        .unwrap_err();
        assert_eq!(err, GuardError::UnknownIdentifier("secret_col".to_string()));
    }

    #[test]
    fn unknown_table_is_ungrounded() {
        let err = check(&candidate("SELECT id FROM users"), &schema(), 500).unwrap_err();
        assert_eq!(err, GuardError::UnknownIdentifier("users".to_string()));
    }

    #[test]
    fn qualified_reference_checks_owning_table() {
        let err = check(
            &candidate("SELECT documents.quantity FROM documents"),
            &schema(),
            500,
        )
        .unwrap_err();
        assert_eq!(
            err,
            GuardError::UnknownIdentifier("documents.quantity".to_string())
        );
    }

    #[test]
    fn join_with_aliases_is_grounded() {
        let q = check(
            &candidate(
                "SELECT d.vendor_name, SUM(i.line_total) AS line_sum \
                 FROM documents d JOIN items i ON d.id = i.document_id \
                 GROUP BY d.vendor_name ORDER BY line_sum DESC",
            ),
            &schema(),
            500,
        )
        .unwrap();
        assert!(q.was_modified);
        assert!(q.sql.ends_with("LIMIT 500"));
    }

    #[test]
    fn cte_name_is_usable() {
        let q = check(
            &candidate(
                "WITH recent AS (SELECT id, total_amount FROM documents) \
                 SELECT total_amount FROM recent LIMIT 10",
            ),
            &schema(),
            500,
        )
        .unwrap();
        assert!(!q.was_modified);
        assert!(!q.sql.contains("LIMIT 500"));
    }

    #[test]
    fn existing_limit_is_not_touched() {
        let q = check(
            &candidate("SELECT id FROM documents LIMIT 5"),
            &schema(),
            500,
        )
        .unwrap();
        assert_eq!(q.sql, "SELECT id FROM documents LIMIT 5");
        assert!(!q.was_modified);
    }

    #[test]
    fn side_channel_function_is_denied() {
        let err = check(&candidate("SELECT pg_sleep(10)"), &schema(), 500).unwrap_err();
        assert_eq!(err, GuardError::DisallowedFunction("pg_sleep".to_string()));
    }

    #[test]
    fn unlisted_function_is_denied() {
        let err = check(
            &candidate("SELECT mystery_fn(vendor_name) FROM documents"),
            &schema(),
            500,
        )
        .unwrap_err();
        assert_eq!(
            err,
            GuardError::DisallowedFunction("mystery_fn".to_string())
        );
    }

    #[test]
    fn aggregation_is_allowed() {
        let q = check(
            &candidate(
                "SELECT vendor_name, SUM(total_amount) FROM documents GROUP BY vendor_name",
            ),
            &schema(),
            500,
        )
        .unwrap();
        assert!(q.sql.contains("SUM(total_amount)"));
    }

    #[test]
    fn empty_statement_is_rejected() {
        let err = check(&candidate("   "), &schema(), 500).unwrap_err();
        assert_eq!(err, GuardError::DisallowedStatementKind);
    }
}
