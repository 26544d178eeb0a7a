use crate::{
    document::DocRecord,
    error::{Error, Result},
    query::{
        expr::{eval, EvalCtx, Expr, QValue},
        json, n1ql, QueryLanguage,
    },
};
use fallible_streaming_iterator::FallibleStreamingIterator;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    ops::Bound,
    sync::Arc,
};

/// Database's index types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    /// Regular index of property value
    ValueIndex,
    /// Full-text index
    FullTextIndex,
}

#[derive(Default)]
pub struct IndexOptions<'a> {
    /// Dominant language of text to be indexed; setting this enables word stemming, i.e.
    /// matching different cases of the same word ("word" and "words", for instance.)
    /// Can be an ISO-639 language code or a lowercase (English) language name.
    /// Stemming is only available for en/english.
    /// If left empty,  or set to an unrecognized language, no stemming occurs.
    pub language: &'a str,
    /// Should diacritical marks (accents) be ignored? Defaults to false.
    /// Generally this should be left false for non-English text.
    pub ignore_diacritics: bool,
    /// "Stemming" coalesces different grammatical forms of the same word,
    /// this flag can be set to `true` to disable it.
    pub disable_stemming: bool,
    /// List of words to ignore ("stop words") for full-text search. Ignoring common words
    /// like "the" and "a" helps keep down the size of the index.
    /// If `None`, English stop words are used.
    /// To suppress stop-words, use an empty list.
    /// To provide a custom list of words, use the words in lowercase.
    pub stop_words: Option<&'a [&'a str]>,
}

/// Value index over one or more expressions
#[derive(Debug, Clone)]
pub struct ValueIndexConfiguration {
    pub expression_language: QueryLanguage,
    /// JSON array of expressions or comma separated N1QL expressions
    pub expressions: String,
}

impl ValueIndexConfiguration {
    pub fn new(expression_language: QueryLanguage, expressions: &str) -> Self {
        Self {
            expression_language,
            expressions: expressions.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FullTextIndexConfiguration {
    pub expression_language: QueryLanguage,
    pub expressions: String,
    pub ignore_accents: bool,
    /// ISO language code or name, `None` disables stemming
    pub language: Option<String>,
}

impl FullTextIndexConfiguration {
    pub fn new(expression_language: QueryLanguage, expressions: &str) -> Self {
        Self {
            expression_language,
            expressions: expressions.into(),
            ignore_accents: false,
            language: None,
        }
    }
}

/// Persisted definition of index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexSpec {
    pub name: String,
    pub kind: IndexType,
    pub expression_language: QueryLanguage,
    pub expressions: String,
    #[serde(default)]
    pub ignore_accents: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub disable_stemming: bool,
    #[serde(default)]
    pub stop_words: Option<Vec<String>>,
}

impl IndexSpec {
    pub(crate) fn value(name: &str, config: &ValueIndexConfiguration) -> Self {
        Self {
            name: name.into(),
            kind: IndexType::ValueIndex,
            expression_language: config.expression_language,
            expressions: config.expressions.clone(),
            ignore_accents: false,
            language: None,
            disable_stemming: false,
            stop_words: None,
        }
    }

    pub(crate) fn full_text(name: &str, config: &FullTextIndexConfiguration) -> Self {
        Self {
            name: name.into(),
            kind: IndexType::FullTextIndex,
            expression_language: config.expression_language,
            expressions: config.expressions.clone(),
            ignore_accents: config.ignore_accents,
            language: config.language.clone(),
            disable_stemming: false,
            stop_words: None,
        }
    }

    pub(crate) fn from_options(
        name: &str,
        expr_json: &str,
        index_type: IndexType,
        opts: Option<IndexOptions>,
    ) -> Self {
        let opts = opts.unwrap_or_default();
        Self {
            name: name.into(),
            kind: index_type,
            expression_language: QueryLanguage::Json,
            expressions: expr_json.into(),
            ignore_accents: opts.ignore_diacritics,
            language: if opts.language.is_empty() {
                None
            } else {
                Some(opts.language.into())
            },
            disable_stemming: opts.disable_stemming,
            stop_words: opts
                .stop_words
                .map(|words| words.iter().map(|w| w.to_lowercase()).collect()),
        }
    }

    pub(crate) fn compile(&self) -> Result<Vec<Expr>> {
        let exprs = match self.expression_language {
            QueryLanguage::Json => json::parse_expression_list(&self.expressions)?,
            QueryLanguage::N1ql => n1ql::parse_expression_list(&self.expressions)?,
        };
        if exprs.is_empty() {
            return Err(Error::InvalidQuery {
                pos: -1,
                query_expr: self.expressions.clone(),
                err: "index needs at least one expression".into(),
            });
        }
        if exprs.iter().any(Expr::has_aggregate) {
            return Err(Error::InvalidQuery {
                pos: -1,
                query_expr: self.expressions.clone(),
                err: "aggregate function can not be indexed".into(),
            });
        }
        Ok(exprs)
    }

    fn tokenizer(&self) -> Tokenizer {
        let stemming = !self.disable_stemming
            && matches!(self.language.as_deref(), Some("en") | Some("english"));
        let stop_words = match &self.stop_words {
            Some(words) => words.iter().cloned().collect(),
            None => ENGLISH_STOP_WORDS.iter().map(|w| w.to_string()).collect(),
        };
        Tokenizer {
            ignore_accents: self.ignore_accents,
            stemming,
            stop_words,
        }
    }
}

#[derive(Debug, Clone)]
enum IndexContent {
    Value {
        entries: BTreeMap<Vec<QValue>, BTreeSet<String>>,
        by_doc: HashMap<String, Vec<QValue>>,
    },
    FullText {
        postings: BTreeMap<String, BTreeMap<String, u32>>,
        doc_terms: HashMap<String, Vec<String>>,
    },
}

/// Definition plus contents of one index, kept in sync with documents of collection
#[derive(Debug, Clone)]
pub(crate) struct IndexData {
    pub spec: IndexSpec,
    exprs: Arc<Vec<Expr>>,
    tokenizer: Arc<Tokenizer>,
    content: IndexContent,
}

impl IndexData {
    pub(crate) fn new(spec: IndexSpec) -> Result<Self> {
        let exprs = Arc::new(spec.compile()?);
        let tokenizer = Arc::new(spec.tokenizer());
        let content = match spec.kind {
            IndexType::ValueIndex => IndexContent::Value {
                entries: BTreeMap::new(),
                by_doc: HashMap::new(),
            },
            IndexType::FullTextIndex => IndexContent::FullText {
                postings: BTreeMap::new(),
                doc_terms: HashMap::new(),
            },
        };
        Ok(Self {
            spec,
            exprs,
            tokenizer,
            content,
        })
    }

    pub(crate) fn build<'a>(
        spec: IndexSpec,
        docs: impl Iterator<Item = &'a DocRecord>,
    ) -> Result<Self> {
        let mut index = Self::new(spec)?;
        for doc in docs {
            index.update_doc(doc);
        }
        Ok(index)
    }

    pub(crate) fn name(&self) -> &str {
        &self.spec.name
    }

    pub(crate) fn exprs(&self) -> &[Expr] {
        &self.exprs
    }

    pub(crate) fn is_full_text(&self) -> bool {
        matches!(self.content, IndexContent::FullText { .. })
    }

    pub(crate) fn clear(&mut self) {
        match &mut self.content {
            IndexContent::Value { entries, by_doc } => {
                entries.clear();
                by_doc.clear();
            }
            IndexContent::FullText {
                postings,
                doc_terms,
            } => {
                postings.clear();
                doc_terms.clear();
            }
        }
    }

    /// Re-index document after save, tombstones are removed from index
    pub(crate) fn update_doc(&mut self, doc: &DocRecord) {
        self.remove_doc(&doc.id);
        if doc.deleted {
            return;
        }
        let no_fts = HashMap::new();
        let ctx = EvalCtx {
            doc: Some(doc),
            params: None,
            fts: &no_fts,
            aggregates: &[],
        };
        let keys: Vec<QValue> = self.exprs.iter().map(|e| eval(e, &ctx)).collect();
        let tokenizer = Arc::clone(&self.tokenizer);
        match &mut self.content {
            IndexContent::Value { entries, by_doc } => {
                if keys.first().map_or(true, QValue::is_missing) {
                    return;
                }
                entries
                    .entry(keys.clone())
                    .or_default()
                    .insert(doc.id.clone());
                by_doc.insert(doc.id.clone(), keys);
            }
            IndexContent::FullText {
                postings,
                doc_terms,
            } => {
                let mut freq = BTreeMap::<String, u32>::new();
                for key in &keys {
                    collect_text(key, &mut |text| {
                        for term in tokenizer.tokenize(text) {
                            *freq.entry(term).or_default() += 1;
                        }
                    });
                }
                if freq.is_empty() {
                    return;
                }
                let terms = freq.keys().cloned().collect();
                for (term, tf) in freq {
                    postings.entry(term).or_default().insert(doc.id.clone(), tf);
                }
                doc_terms.insert(doc.id.clone(), terms);
            }
        }
    }

    pub(crate) fn remove_doc(&mut self, doc_id: &str) {
        match &mut self.content {
            IndexContent::Value { entries, by_doc } => {
                if let Some(keys) = by_doc.remove(doc_id) {
                    if let Some(ids) = entries.get_mut(&keys) {
                        ids.remove(doc_id);
                        if ids.is_empty() {
                            entries.remove(&keys);
                        }
                    }
                }
            }
            IndexContent::FullText {
                postings,
                doc_terms,
            } => {
                for term in doc_terms.remove(doc_id).unwrap_or_default() {
                    if let Some(docs) = postings.get_mut(&term) {
                        docs.remove(doc_id);
                        if docs.is_empty() {
                            postings.remove(&term);
                        }
                    }
                }
            }
        }
    }

    /// IDs of documents whose first indexed value lies in range, in key order
    pub(crate) fn lookup(&self, lo: Bound<&QValue>, hi: Bound<&QValue>) -> Vec<String> {
        let IndexContent::Value { entries, .. } = &self.content else {
            return Vec::new();
        };
        let start = match lo {
            Bound::Included(v) | Bound::Excluded(v) => Bound::Included(vec![v.clone()]),
            Bound::Unbounded => Bound::Unbounded,
        };
        let mut ret = Vec::new();
        for (keys, ids) in entries.range((start, Bound::Unbounded)) {
            let Some(first) = keys.first() else {
                continue;
            };
            if let Bound::Excluded(v) = lo {
                if first == v {
                    continue;
                }
            }
            let in_range = match hi {
                Bound::Included(v) => first <= v,
                Bound::Excluded(v) => first < v,
                Bound::Unbounded => true,
            };
            if !in_range {
                break;
            }
            ret.extend(ids.iter().cloned());
        }
        ret
    }

    pub(crate) fn tokenize_query(&self, text: &str) -> Vec<String> {
        let mut terms = self.tokenizer.tokenize(text);
        terms.sort();
        terms.dedup();
        terms
    }

    /// Documents containing every term
    pub(crate) fn fts_candidates(&self, terms: &[String]) -> BTreeSet<String> {
        let IndexContent::FullText { postings, .. } = &self.content else {
            return BTreeSet::new();
        };
        let mut ret: Option<BTreeSet<String>> = None;
        for term in terms {
            let docs: BTreeSet<String> = postings
                .get(term)
                .map(|d| d.keys().cloned().collect())
                .unwrap_or_default();
            ret = Some(match ret {
                Some(prev) => prev.intersection(&docs).cloned().collect(),
                None => docs,
            });
        }
        ret.unwrap_or_default()
    }

    pub(crate) fn fts_matches(&self, doc_id: &str, terms: &[String]) -> bool {
        let IndexContent::FullText { postings, .. } = &self.content else {
            return false;
        };
        !terms.is_empty()
            && terms
                .iter()
                .all(|t| postings.get(t).map_or(false, |d| d.contains_key(doc_id)))
    }

    pub(crate) fn fts_rank(&self, doc_id: &str, terms: &[String]) -> u32 {
        let IndexContent::FullText { postings, .. } = &self.content else {
            return 0;
        };
        terms
            .iter()
            .filter_map(|t| postings.get(t).and_then(|d| d.get(doc_id)))
            .sum()
    }

    pub(crate) fn info(&self) -> IndexInfo {
        IndexInfo {
            name: self.spec.name.clone(),
            type_: self.spec.kind,
            expr: self.spec.expressions.clone(),
        }
    }
}

fn collect_text(value: &QValue, f: &mut dyn FnMut(&str)) {
    match value {
        QValue::String(s) => f(s),
        QValue::Array(items) => items.iter().for_each(|x| collect_text(x, f)),
        QValue::Dict(items) => items.values().for_each(|x| collect_text(x, f)),
        _ => {}
    }
}

const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
    "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with",
];

#[derive(Debug)]
struct Tokenizer {
    ignore_accents: bool,
    stemming: bool,
    stop_words: HashSet<String>,
}

impl Tokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| {
                let w = w.to_lowercase();
                if self.ignore_accents {
                    w.chars().map(fold_accent).collect()
                } else {
                    w
                }
            })
            .filter(|w| !self.stop_words.contains(w))
            .map(|w| if self.stemming { stem_english(w) } else { w })
            .collect()
    }
}

fn stem_english(mut word: String) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        if word.ends_with("ies") {
            word.truncate(word.len() - 3);
            word.push('y');
        } else if ["xes", "ches", "shes", "sses"]
            .iter()
            .any(|end| word.ends_with(end))
        {
            word.truncate(word.len() - 2);
        } else {
            word.pop();
        }
    }
    word
}

fn fold_accent(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' => 'i',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' => 'u',
        'ý' | 'ÿ' => 'y',
        'š' | 'ś' => 's',
        'ž' | 'ź' | 'ż' => 'z',
        'ł' => 'l',
        'ř' => 'r',
        _ => c,
    }
}

pub(crate) struct DbIndexesListIterator {
    infos: std::vec::IntoIter<IndexInfo>,
    cur_val: Option<IndexInfo>,
}

impl DbIndexesListIterator {
    pub(crate) fn new(infos: Vec<IndexInfo>) -> Self {
        Self {
            infos: infos.into_iter(),
            cur_val: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexInfo {
    name: String,
    type_: IndexType,
    expr: String,
}

impl IndexInfo {
    #[inline]
    pub fn name_as_str(&self) -> Result<&str> {
        Ok(&self.name)
    }
    #[inline]
    pub fn type_(&self) -> IndexType {
        self.type_
    }
    #[inline]
    pub fn expr_as_str(&self) -> Result<&str> {
        Ok(&self.expr)
    }
}

impl FallibleStreamingIterator for DbIndexesListIterator {
    type Error = Error;
    type Item = IndexInfo;

    fn advance(&mut self) -> Result<()> {
        self.cur_val = self.infos.next();
        Ok(())
    }

    #[inline]
    fn get(&self) -> Option<&IndexInfo> {
        self.cur_val.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, json: &str) -> DocRecord {
        let body = serde_json::from_str::<serde_json::Value>(json).unwrap();
        DocRecord {
            id: id.into(),
            rev_id: "1-abc".into(),
            sequence: 1,
            deleted: false,
            body: serde_fleece::to_fl_slice_result(&body).unwrap(),
            history: vec!["1-abc".into()],
            expiration: None,
            remote_revs: BTreeMap::new(),
        }
    }

    #[test]
    fn test_value_index_lookup() {
        let spec = IndexSpec::value(
            "by_age",
            &ValueIndexConfiguration::new(QueryLanguage::N1ql, "age, name"),
        );
        let docs = vec![
            doc("a", r#"{"age": 30, "name": "a"}"#),
            doc("b", r#"{"age": 20, "name": "b"}"#),
            doc("c", r#"{"age": 30, "name": "c"}"#),
            doc("d", r#"{"name": "d"}"#),
        ];
        let mut index = IndexData::build(spec, docs.iter()).unwrap();
        let thirty = QValue::Int(30);
        assert_eq!(
            index.lookup(Bound::Included(&thirty), Bound::Included(&thirty)),
            vec!["a".to_string(), "c".to_string()]
        );
        assert_eq!(
            index.lookup(Bound::Unbounded, Bound::Excluded(&thirty)),
            vec!["b".to_string()]
        );
        assert!(index
            .lookup(Bound::Excluded(&thirty), Bound::Unbounded)
            .is_empty());

        let mut gone = doc("a", "{}");
        gone.deleted = true;
        index.update_doc(&gone);
        assert_eq!(
            index.lookup(Bound::Included(&thirty), Bound::Unbounded),
            vec!["c".to_string()]
        );
    }

    #[test]
    fn test_full_text_index() {
        let spec = IndexSpec::from_options(
            "fts",
            r#"[[".text"]]"#,
            IndexType::FullTextIndex,
            Some(IndexOptions {
                language: "en",
                ignore_diacritics: true,
                ..Default::default()
            }),
        );
        let docs = vec![
            doc("1", r#"{"text": "The quick brown fox jumps"}"#),
            doc("2", r#"{"text": "Café for foxes, fox food"}"#),
            doc("3", r#"{"text": "nothing here"}"#),
        ];
        let index = IndexData::build(spec, docs.iter()).unwrap();
        let terms = index.tokenize_query("FOX");
        assert_eq!(terms, vec!["fox".to_string()]);
        let found: Vec<String> = index.fts_candidates(&terms).into_iter().collect();
        assert_eq!(found, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(index.fts_rank("2", &terms), 2);

        let terms = index.tokenize_query("cafe fox");
        assert!(index.fts_matches("2", &terms));
        assert!(!index.fts_matches("1", &terms));
        assert!(index.tokenize_query("the").is_empty());
    }
}
